//! Header utilities shared by the HTTP and RPC paths.
//!
//! HTTP headers live in an [`http::HeaderMap`] (names are case-insensitive
//! by construction). RPC application headers are a plain ordered map that
//! keeps the caller's spelling; lookups on it ignore ASCII case.

use std::collections::BTreeMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// RPC application headers (arg2).
pub type RpcHeaders = BTreeMap<String, String>;

/// Key under which the RPC client records call duration on response headers.
pub const CLIENT_RESPONSE_DURATION_KEY: &str = "client.response.duration";

/// Read/write access to a header collection, independent of transport.
pub trait HeaderCarrier {
    /// Case-insensitive lookup.
    fn get_header(&self, name: &str) -> Option<&str>;

    /// Set `name` to `value`, replacing any existing entry that differs
    /// only in case.
    fn set_header(&mut self, name: &str, value: &str);

    fn header_names(&self) -> Vec<String>;
}

impl HeaderCarrier for HeaderMap {
    fn get_header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    fn set_header(&mut self, name: &str, value: &str) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.insert(name, value);
            }
            _ => tracing::debug!(header = name, "Skipping header that is not valid HTTP"),
        }
    }

    fn header_names(&self) -> Vec<String> {
        self.keys().map(|k| k.as_str().to_string()).collect()
    }
}

impl HeaderCarrier for RpcHeaders {
    fn get_header(&self, name: &str) -> Option<&str> {
        if let Some(v) = self.get(name) {
            return Some(v.as_str());
        }
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.retain(|k, _| k == name || !k.eq_ignore_ascii_case(name));
        self.insert(name.to_string(), value.to_string());
    }

    fn header_names(&self) -> Vec<String> {
        self.keys().cloned().collect()
    }
}

/// Names from `expected` that are absent or empty on `carrier`.
pub fn missing_headers<C: HeaderCarrier + ?Sized>(carrier: &C, expected: &[&str]) -> Vec<String> {
    expected
        .iter()
        .filter(|name| carrier.get_header(name).map_or(true, str::is_empty))
        .map(|name| name.to_string())
        .collect()
}

/// Flatten an HTTP header map into string pairs; non-UTF-8 values are
/// rendered lossily and repeated names are joined with `,`.
pub fn header_map_to_strings(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}
