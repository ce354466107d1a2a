//! Lifecycle management.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     trigger() → server loops stop accepting → drain open connections
//!               → cancel what is still running after the drain timeout
//! ```
//!
//! # Design Decisions
//! - One broadcast signal for every server loop
//! - Process signals and bootstrapping belong to the embedding binary

pub mod shutdown;

pub use shutdown::Shutdown;
