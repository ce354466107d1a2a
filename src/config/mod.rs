//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → HttpClient::from_config / RpcClient::from_config / RpcServer::bind
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; embedders own reloading
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AltSubchannelConfig, GatewayConfig, HttpClientConfig, HttpRetryConfig, HttpServerConfig,
    ObservabilityConfig, RpcClientConfig, RpcServerConfig, RuleConfig,
};
pub use validation::{validate_config, ValidationError};
