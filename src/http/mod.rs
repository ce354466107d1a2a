//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound:
//!     HttpClient (shared pool, defaults)
//!     → client_request.rs (write_json / write_bytes, check_headers)
//!     → send: span + attempt loop under timeout/retry options
//!     → client_response.rs (read_all → finish: latency, status, errors)
//!
//! Inbound:
//!     HttpServer (HttpServerConfig: bind address, request timeout)
//!     → axum Router (server.rs: trace + timeout layers)
//!     → HttpEndpoint::handle (seed context, uuid, span, extractors)
//!     → handler(ServerHttpRequest, ServerHttpResponse)
//!     → response.rs (staged body, peek, flush → endpoint metrics)
//! ```
//!
//! # Design Decisions
//! - Both directions share `status.rs` for known-code and error classification
//! - Request and response wrappers carry the context; nothing is global

pub mod client;
pub mod client_request;
pub mod client_response;
pub mod request;
pub mod response;
pub mod server;
pub mod status;

pub use client::{HttpClient, HttpClientBuilder};
pub use client_request::{ClientHttpRequest, OutgoingRequest};
pub use client_response::{ClientHttpResponse, JsonCandidate};
pub use request::ServerHttpRequest;
pub use response::ServerHttpResponse;
pub use server::{router, HttpEndpoint, HttpHandler, HttpServer, HttpServerError, RouterError};
