//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Outbound HTTP call:
//!     → timeouts.rs (per-call TimeoutAndRetryOptions from the context)
//!     → per attempt: child context bounded by per_attempt_timeout
//!     → on failure: retries.rs RetryPolicy (sleep via backoff.rs, or stop)
//!
//! Outbound RPC call:
//!     → retries.rs run_with_retry (transport harness, transient codes only)
//! ```
//!
//! # Design Decisions
//! - Every external call has a deadline
//! - Overall timeout caps the whole harness; per-attempt timeout caps one try
//! - Backoff is fixed, never jittered, and aborts when the context finishes

pub mod backoff;
pub mod retries;
pub mod timeouts;

pub use retries::{run_with_retry, DefaultRetryPolicy, RetryOptions, RetryPolicy};
pub use timeouts::TimeoutAndRetryOptions;
