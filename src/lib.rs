//! Runtime core for gateways that sit between inbound HTTP/RPC endpoints and
//! outbound HTTP/RPC backends.
//!
//! Every call carries a [`RequestContext`] with scope tags, log fields, a
//! request UUID, cancellation and retry options. Outbound clients and inbound
//! endpoints read that context to emit uniform metrics and logs.

pub mod capture;
pub mod config;
pub mod context;
pub mod errors;
pub mod headers;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod resilience;
pub mod rpc;
pub mod testing;

pub use config::GatewayConfig;
pub use context::{ContextError, ContextExtractors, LogField, RequestContext};
pub use errors::{ClientError, ClientResult};
pub use lifecycle::Shutdown;
pub use observability::Instrumentation;
pub use resilience::TimeoutAndRetryOptions;
