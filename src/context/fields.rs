//! Typed structured-log fields.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Value carried by a [`LogField`].
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Error(String),
    Time(SystemTime),
    Bool(bool),
    Duration(Duration),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::String(s) | FieldValue::Error(s) => f.write_str(s),
            FieldValue::Int(i) => write!(f, "{i}"),
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Duration(d) => write!(f, "{d:?}"),
            FieldValue::Time(t) => {
                let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
                write!(f, "{}.{:09}", since.as_secs(), since.subsec_nanos())
            }
        }
    }
}

/// A single key/value pair attached to a log entry.
#[derive(Debug, Clone, PartialEq)]
pub struct LogField {
    pub key: String,
    pub value: FieldValue,
}

impl LogField {
    pub fn string(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: FieldValue::String(value.into()),
        }
    }

    pub fn int(key: impl Into<String>, value: i64) -> Self {
        Self {
            key: key.into(),
            value: FieldValue::Int(value),
        }
    }

    /// Field keyed `error` holding the rendered error chain head.
    pub fn error(err: &dyn std::error::Error) -> Self {
        Self {
            key: "error".to_string(),
            value: FieldValue::Error(err.to_string()),
        }
    }

    pub fn time(key: impl Into<String>, value: SystemTime) -> Self {
        Self {
            key: key.into(),
            value: FieldValue::Time(value),
        }
    }

    pub fn bool(key: impl Into<String>, value: bool) -> Self {
        Self {
            key: key.into(),
            value: FieldValue::Bool(value),
        }
    }

    pub fn duration(key: impl Into<String>, value: Duration) -> Self {
        Self {
            key: key.into(),
            value: FieldValue::Duration(value),
        }
    }
}

impl fmt::Display for LogField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_key_value() {
        assert_eq!(LogField::int("attempt_count", 2).to_string(), "attempt_count=2");
        assert_eq!(LogField::string("client", "bar").to_string(), "client=bar");
        assert_eq!(LogField::bool("sampled", true).to_string(), "sampled=true");
    }

    #[test]
    fn error_field_uses_error_key() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let field = LogField::error(&err);
        assert_eq!(field.key, "error");
        assert_eq!(field.value, FieldValue::Error("boom".to_string()));
    }
}
