//! RPC framing-level errors.
//!
//! # Responsibilities
//! - Enumerate the system error codes carried on error frames
//! - Map codes to the metric tag values used by `client.system-errors`
//! - Describe malformed-frame conditions
//!
//! # Design Decisions
//! - `SystemError` is returned unwrapped from the RPC client so callers can
//!   match on `code`
//! - Only timeout, bad-request, protocol and cancelled get their own metric
//!   tag; every other code is tagged `unknown`

use std::fmt;

use thiserror::Error;

/// Framing-level failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SystemErrorCode {
    Timeout,
    Cancelled,
    Busy,
    Declined,
    UnexpectedError,
    BadRequest,
    NetworkError,
    Protocol,
    Unknown,
}

impl SystemErrorCode {
    pub fn as_u8(&self) -> u8 {
        match self {
            SystemErrorCode::Unknown => 0x00,
            SystemErrorCode::Timeout => 0x01,
            SystemErrorCode::Cancelled => 0x02,
            SystemErrorCode::Busy => 0x03,
            SystemErrorCode::Declined => 0x04,
            SystemErrorCode::UnexpectedError => 0x05,
            SystemErrorCode::BadRequest => 0x06,
            SystemErrorCode::NetworkError => 0x07,
            SystemErrorCode::Protocol => 0xff,
        }
    }

    /// Unrecognised bytes map to [`SystemErrorCode::Unknown`].
    pub fn from_u8(code: u8) -> Self {
        match code {
            0x01 => SystemErrorCode::Timeout,
            0x02 => SystemErrorCode::Cancelled,
            0x03 => SystemErrorCode::Busy,
            0x04 => SystemErrorCode::Declined,
            0x05 => SystemErrorCode::UnexpectedError,
            0x06 => SystemErrorCode::BadRequest,
            0x07 => SystemErrorCode::NetworkError,
            0xff => SystemErrorCode::Protocol,
            _ => SystemErrorCode::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemErrorCode::Timeout => "timeout",
            SystemErrorCode::Cancelled => "cancelled",
            SystemErrorCode::Busy => "busy",
            SystemErrorCode::Declined => "declined",
            SystemErrorCode::UnexpectedError => "unexpected-error",
            SystemErrorCode::BadRequest => "bad-request",
            SystemErrorCode::NetworkError => "network-error",
            SystemErrorCode::Protocol => "protocol",
            SystemErrorCode::Unknown => "unknown",
        }
    }

    /// Value for the `error` tag on system-error counters.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            SystemErrorCode::Timeout
            | SystemErrorCode::BadRequest
            | SystemErrorCode::Protocol
            | SystemErrorCode::Cancelled => self.name(),
            _ => SystemErrorCode::Unknown.name(),
        }
    }

    /// Codes the transport retry harness treats as transient.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SystemErrorCode::Busy
                | SystemErrorCode::Declined
                | SystemErrorCode::NetworkError
                | SystemErrorCode::Timeout
        )
    }
}

impl fmt::Display for SystemErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed error frame from the peer, or a local transport failure of the
/// same class.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc system error ({code}): {message}")]
pub struct SystemError {
    pub code: SystemErrorCode,
    pub message: String,
}

impl SystemError {
    pub fn new(code: SystemErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Malformed or unexpected bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("found unexpected bytes after {stage}, found (upto 128 bytes): {hex}")]
    TrailingBytes { stage: String, hex: String },

    #[error("truncated {what}")]
    Truncated { what: &'static str },

    #[error("invalid utf-8 in {what}")]
    InvalidUtf8 { what: &'static str },

    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    #[error("unexpected {got} frame")]
    UnexpectedFrame { got: &'static str },

    #[error("{what} too long: {len} bytes")]
    TooLong { what: &'static str, len: usize },
}

/// Endpoint registry failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("handler for '{method}' is already registered")]
    AlreadyRegistered { method: String },

    #[error("method '{method}' must be of the form Service::method")]
    InvalidMethod { method: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_collapse() {
        assert_eq!(SystemErrorCode::from_u8(0x42), SystemErrorCode::Unknown);
        assert_eq!(SystemErrorCode::from_u8(0x01), SystemErrorCode::Timeout);
        assert_eq!(SystemErrorCode::Busy.metric_tag(), "unknown");
        assert_eq!(SystemErrorCode::Timeout.metric_tag(), "timeout");
        assert_eq!(SystemErrorCode::BadRequest.metric_tag(), "bad-request");
    }

    #[test]
    fn codes_round_trip_through_bytes() {
        for code in [
            SystemErrorCode::Timeout,
            SystemErrorCode::Cancelled,
            SystemErrorCode::Busy,
            SystemErrorCode::Declined,
            SystemErrorCode::UnexpectedError,
            SystemErrorCode::BadRequest,
            SystemErrorCode::NetworkError,
            SystemErrorCode::Protocol,
        ] {
            assert_eq!(SystemErrorCode::from_u8(code.as_u8()), code);
        }
    }

    #[test]
    fn system_error_renders_code_name() {
        let err = SystemError::new(SystemErrorCode::Timeout, "deadline");
        assert_eq!(err.to_string(), "rpc system error (timeout): deadline");
    }
}
