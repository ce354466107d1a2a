//! Network layer for the inbound RPC server.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs   (accept loop, connection limit permit)
//!     → connection.rs (connection id, open-connection count)
//!     → rpc::server   (frame read, dispatch, frame write)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Every connection is tracked so shutdown can drain in-flight calls

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};
