//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (rules reference declared alt subchannels)
//! - Validate value ranges (timeouts > 0, attempt budgets)
//! - Detect duplicate client identifiers
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;

use regex::Regex;
use thiserror::Error;

use crate::config::schema::{GatewayConfig, HttpClientConfig, RpcClientConfig};

/// A single semantic violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{kind} client has an empty client_id")]
    EmptyClientId { kind: &'static str },

    #[error("duplicate client_id '{client_id}'")]
    DuplicateClientId { client_id: String },

    #[error("client '{client_id}': {field} must be greater than zero")]
    ZeroValue {
        client_id: String,
        field: &'static str,
    },

    #[error("client '{client_id}': per-attempt timeout {per_attempt_ms}ms exceeds overall timeout {overall_ms}ms")]
    PerAttemptExceedsOverall {
        client_id: String,
        per_attempt_ms: u64,
        overall_ms: u64,
    },

    #[error("client '{client_id}': base_url '{base_url}' is not a valid URL")]
    InvalidBaseUrl { client_id: String, base_url: String },

    #[error("client '{client_id}': rules configured without header_patterns")]
    RulesWithoutPatterns { client_id: String },

    #[error("client '{client_id}': rule references unknown alt subchannel '{name}'")]
    UnknownAltSubchannel { client_id: String, name: String },

    #[error("client '{client_id}': invalid rule pattern '{pattern}': {reason}")]
    InvalidPattern {
        client_id: String,
        pattern: String,
        reason: String,
    },

    #[error("client '{client_id}': rule value must be [alt_channel] or [alt_channel, routing_delegate]")]
    InvalidRuleValue { client_id: String },

    #[error("client '{client_id}': peer '{peer}' is not a socket address")]
    InvalidPeer { client_id: String, peer: String },
}

/// Validate the whole configuration, collecting every violation.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();

    for client in &config.http_clients {
        validate_http_client(client, &mut errors);
        if !client.client_id.is_empty() && !seen.insert(client.client_id.clone()) {
            errors.push(ValidationError::DuplicateClientId {
                client_id: client.client_id.clone(),
            });
        }
    }
    for client in &config.rpc_clients {
        validate_rpc_client(client, &mut errors);
        if !client.client_id.is_empty() && !seen.insert(client.client_id.clone()) {
            errors.push(ValidationError::DuplicateClientId {
                client_id: client.client_id.clone(),
            });
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_http_client(client: &HttpClientConfig, errors: &mut Vec<ValidationError>) {
    if client.client_id.is_empty() {
        errors.push(ValidationError::EmptyClientId { kind: "http" });
    }
    if client.timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue {
            client_id: client.client_id.clone(),
            field: "timeout_ms",
        });
    }
    if url::Url::parse(&client.base_url).is_err() {
        errors.push(ValidationError::InvalidBaseUrl {
            client_id: client.client_id.clone(),
            base_url: client.base_url.clone(),
        });
    }
    if let Some(retry) = &client.retry {
        if let Some(overall) = retry.overall_timeout_ms {
            if retry.per_attempt_timeout_ms > overall {
                errors.push(ValidationError::PerAttemptExceedsOverall {
                    client_id: client.client_id.clone(),
                    per_attempt_ms: retry.per_attempt_timeout_ms,
                    overall_ms: overall,
                });
            }
        }
    }
}

fn validate_rpc_client(client: &RpcClientConfig, errors: &mut Vec<ValidationError>) {
    let id = &client.client_id;
    if id.is_empty() {
        errors.push(ValidationError::EmptyClientId { kind: "rpc" });
    }
    if client.timeout_ms == 0 {
        errors.push(ValidationError::ZeroValue {
            client_id: id.clone(),
            field: "timeout_ms",
        });
    }
    if client.timeout_per_attempt_ms == 0 {
        errors.push(ValidationError::ZeroValue {
            client_id: id.clone(),
            field: "timeout_per_attempt_ms",
        });
    }
    if client.max_attempts == 0 {
        errors.push(ValidationError::ZeroValue {
            client_id: id.clone(),
            field: "max_attempts",
        });
    }
    if client.timeout_per_attempt_ms > client.timeout_ms {
        errors.push(ValidationError::PerAttemptExceedsOverall {
            client_id: id.clone(),
            per_attempt_ms: client.timeout_per_attempt_ms,
            overall_ms: client.timeout_ms,
        });
    }

    let peers = client
        .peers
        .iter()
        .chain(client.alt_subchannels.iter().flat_map(|alt| alt.peers.iter()));
    for peer in peers {
        if peer.parse::<std::net::SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidPeer {
                client_id: id.clone(),
                peer: peer.clone(),
            });
        }
    }

    if client.rules.is_empty() {
        return;
    }
    if client.header_patterns.is_empty() {
        errors.push(ValidationError::RulesWithoutPatterns { client_id: id.clone() });
    }
    let alt_names: HashSet<&str> = client
        .alt_subchannels
        .iter()
        .map(|alt| alt.name.as_str())
        .collect();
    for rule in &client.rules {
        for pattern in &rule.patterns {
            if let Err(e) = Regex::new(pattern) {
                errors.push(ValidationError::InvalidPattern {
                    client_id: id.clone(),
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }
        match rule.value.first() {
            Some(name) if rule.value.len() <= 2 => {
                if !alt_names.contains(name.as_str()) {
                    errors.push(ValidationError::UnknownAltSubchannel {
                        client_id: id.clone(),
                        name: name.clone(),
                    });
                }
            }
            _ => errors.push(ValidationError::InvalidRuleValue { client_id: id.clone() }),
        }
    }
}
