//! Error types shared by the outbound and inbound paths.

use bytes::Bytes;
use thiserror::Error;

pub use crate::context::ContextError;
pub use crate::rpc::errors::{ProtocolError, RegistryError, SystemError, SystemErrorCode};

/// Result alias for outbound client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Everything an outbound HTTP or RPC call can fail with.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The JSON codec failed on the outgoing body.
    #[error("Could not serialize {client_id}.{method} request json: {source}")]
    Serialize {
        client_id: String,
        method: String,
        #[source]
        source: serde_json::Error,
    },

    /// A non-JSON body codec failed on the outgoing body.
    #[error("Could not encode {client_id}.{method} request: {reason}")]
    Encode {
        client_id: String,
        method: String,
        reason: String,
    },

    #[error("Could not create outbound {client_id}.{method} request: {reason}")]
    RequestBuild {
        client_id: String,
        method: String,
        reason: String,
    },

    #[error("missing mandatory headers: {}", .names.join(", "))]
    MissingHeaders { names: Vec<String> },

    #[error("transport error: {reason}")]
    Transport { reason: String },

    #[error(transparent)]
    System(#[from] SystemError),

    #[error("Unexpected http client response ({code})")]
    UnexpectedStatus { code: u16, body: Bytes },

    #[error("Could not parse {client_id}.{method} response into {type_name}: {reason}")]
    Unmarshal {
        client_id: String,
        method: String,
        type_name: &'static str,
        reason: String,
    },

    #[error(
        "Could not parse {client_id}.{method} response into any of [{}]",
        render_failures(.failures)
    )]
    UnmarshalMultiple {
        client_id: String,
        method: String,
        failures: Vec<(&'static str, String)>,
    },

    #[error("Could not read response body: {reason}")]
    Read { reason: String },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Diagnostic wrapper naming the client and method.
    #[error("errors while making outbound {client_id}.{method} request: {source}")]
    Outbound {
        client_id: String,
        method: String,
        #[source]
        source: Box<ClientError>,
    },
}

fn render_failures(failures: &[(&'static str, String)]) -> String {
    failures
        .iter()
        .map(|(ty, err)| format!("{ty}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl ClientError {
    /// Wrap with client and method for diagnostics.
    pub fn outbound(client_id: &str, method: &str, source: ClientError) -> Self {
        ClientError::Outbound {
            client_id: client_id.to_string(),
            method: method.to_string(),
            source: Box::new(source),
        }
    }

    /// The system error at the root of this error, if any.
    pub fn system_error(&self) -> Option<&SystemError> {
        match self {
            ClientError::System(err) => Some(err),
            ClientError::Outbound { source, .. } => source.system_error(),
            _ => None,
        }
    }

    pub fn context_error(&self) -> Option<ContextError> {
        match self {
            ClientError::Context(err) => Some(*err),
            ClientError::Outbound { source, .. } => source.context_error(),
            _ => None,
        }
    }

    /// Whether the RPC retry harness may try again after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::System(err) => err.code.is_retryable(),
            ClientError::Transport { .. } => true,
            ClientError::Outbound { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Failures while reading an inbound request.
#[derive(Debug, Error)]
pub enum InboundError {
    #[error("Could not read request body: {reason}")]
    ReadBody { reason: String },

    #[error("Could not parse json: {source}")]
    Unmarshal {
        #[source]
        source: serde_json::Error,
    },
}
