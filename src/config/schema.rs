//! Configuration schema definitions.
//!
//! This module defines the configuration structure for the gateway runtime.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::TimeoutAndRetryOptions;

/// Root configuration for the gateway runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Header carrying the request UUID in and out. Empty disables
    /// propagation.
    pub request_uuid_header_key: String,

    /// Outbound HTTP clients.
    pub http_clients: Vec<HttpClientConfig>,

    /// Outbound RPC clients.
    pub rpc_clients: Vec<RpcClientConfig>,

    /// Inbound HTTP server settings.
    pub http_server: HttpServerConfig,

    /// Inbound RPC server settings.
    pub rpc_server: RpcServerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Outbound HTTP client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpClientConfig {
    /// Client identifier used in metrics tags and log fields.
    pub client_id: String,

    /// Base URL prepended to relative request paths.
    pub base_url: String,

    /// Headers set on every request before per-call headers.
    pub default_headers: BTreeMap<String, String>,

    /// Method name → downstream endpoint name.
    pub methods: BTreeMap<String, String>,

    /// Per-attempt timeout when the context carries no retry options.
    pub timeout_ms: u64,

    /// Follow 3xx responses instead of returning them.
    pub follow_redirect: bool,

    /// Idle pooled connections kept per host.
    pub max_idle_per_host: usize,

    /// Client-wide retry default; per-call context options take precedence.
    pub retry: Option<HttpRetryConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            base_url: String::new(),
            default_headers: BTreeMap::new(),
            methods: BTreeMap::new(),
            timeout_ms: 10_000,
            follow_redirect: true,
            max_idle_per_host: 500,
            retry: None,
        }
    }
}

impl HttpClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry budget for an HTTP client.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpRetryConfig {
    pub max_attempts: u32,
    pub per_attempt_timeout_ms: u64,
    /// Derived from the per-attempt budget when absent.
    pub overall_timeout_ms: Option<u64>,
    pub backoff_ms: u64,
}

impl Default for HttpRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            per_attempt_timeout_ms: 1_000,
            overall_timeout_ms: None,
            backoff_ms: 10,
        }
    }
}

impl HttpRetryConfig {
    pub fn options(&self) -> TimeoutAndRetryOptions {
        let per_attempt = Duration::from_millis(self.per_attempt_timeout_ms);
        let mut options = TimeoutAndRetryOptions::from_per_attempt(per_attempt, self.max_attempts);
        options.backoff_between_attempts = Duration::from_millis(self.backoff_ms);
        if let Some(overall) = self.overall_timeout_ms {
            options.overall_timeout = Duration::from_millis(overall);
        }
        options
    }
}

/// Outbound RPC client configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcClientConfig {
    pub client_id: String,

    /// Downstream service name for the default subchannel.
    pub service_name: String,

    /// Peer addresses of the default subchannel.
    pub peers: Vec<String>,

    /// `Service::method` → client method name.
    pub method_names: BTreeMap<String, String>,

    /// Overall call timeout.
    pub timeout_ms: u64,

    pub timeout_per_attempt_ms: u64,

    pub max_attempts: u32,

    pub routing_key: Option<String>,

    /// Alternate subchannels selectable by the rule engine.
    pub alt_subchannels: Vec<AltSubchannelConfig>,

    /// Header names consulted, in order, for dynamic channel selection.
    pub header_patterns: Vec<String>,

    /// Rule table for dynamic channel selection.
    pub rules: Vec<RuleConfig>,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            service_name: String::new(),
            peers: Vec::new(),
            method_names: BTreeMap::new(),
            timeout_ms: 2_000,
            timeout_per_attempt_ms: 1_000,
            max_attempts: 1,
            routing_key: None,
            alt_subchannels: Vec::new(),
            header_patterns: Vec::new(),
            rules: Vec::new(),
        }
    }
}

/// A named alternate subchannel.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AltSubchannelConfig {
    pub name: String,
    pub service_name: String,
    #[serde(default)]
    pub peers: Vec<String>,
}

/// One rule: regex patterns matched positionally, plus the value returned
/// when all of them match.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub patterns: Vec<String>,
    pub value: Vec<String>,
}

/// Inbound HTTP server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Request timeout applied by the tower layer, in seconds.
    pub request_timeout_secs: u64,
}

impl HttpServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 30,
        }
    }
}

/// Inbound RPC server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RpcServerConfig {
    /// Service name this server answers for.
    pub service_name: String,

    /// Bind address (e.g., "0.0.0.0:4040").
    pub bind_address: String,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for RpcServerConfig {
    fn default() -> Self {
        Self {
            service_name: "gateway".to_string(),
            bind_address: "0.0.0.0:4040".to_string(),
            max_connections: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
