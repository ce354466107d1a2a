//! Binary RPC: framed TCP transport, outbound client, inbound server.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     RpcClient::call
//!         → codec.rs          (arg3 body encode)
//!         → headers.rs        (arg2 header framing)
//!         → rule_engine.rs    (default or alt subchannel, routing delegate)
//!         → resilience        (transport retry harness)
//!         → channel.rs        (peer choice, call-request frame, one attempt)
//!         → outbound_call.rs  (latency + success / app-errors / system-errors)
//!
//! Inbound:
//!     RpcServer (net::Listener) → frame.rs decode
//!         → RpcRouter::handle (context seed, extractors, handler task)
//!         → call-response or error frame
//! ```
//!
//! # Design Decisions
//! - arg2 and arg3 travel as separate payloads so headers never need the
//!   body codec
//! - Both header and body readers must be fully consumed; residue is a
//!   protocol error
//! - System errors stay typed end to end

pub mod channel;
pub mod client;
pub mod codec;
pub mod errors;
pub mod frame;
pub mod headers;
pub mod outbound_call;
pub mod rule_engine;
pub mod server;

pub use channel::{Channel, SubChannel};
pub use client::{RpcClient, RpcResponse};
pub use codec::{CodecError, JsonStruct, RawBody, WireStruct};
pub use errors::{ProtocolError, RegistryError, SystemError, SystemErrorCode};
pub use frame::{CallRequest, CallResponse, ErrorFrame, Frame};
pub use outbound_call::RpcOutboundCall;
pub use rule_engine::RuleEngine;
pub use server::{
    decode_body, HandlerError, RpcEndpoint, RpcHandler, RpcHandlerResponse, RpcRouter, RpcServer,
};
