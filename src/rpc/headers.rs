//! Arg2 header framing.
//!
//! Arg2 is a u16 pair count followed by that many (key, value) pairs, each
//! string prefixed by its u16 length. An empty arg2 decodes to no headers.

use bytes::{Bytes, BytesMut};

use crate::headers::RpcHeaders;
use crate::rpc::errors::ProtocolError;
use crate::rpc::frame::{get_str16, get_u16, put_str16, put_u16_len};

const MAX_RESIDUAL_HEX_BYTES: usize = 128;

pub fn write_headers(headers: &RpcHeaders) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    put_u16_len(&mut buf, headers.len(), "arg2 headers")?;
    for (key, value) in headers {
        put_str16(&mut buf, key, "arg2 header key")?;
        put_str16(&mut buf, value, "arg2 header value")?;
    }
    Ok(buf.freeze())
}

/// Decode headers from the front of `buf`, leaving any residue in place.
pub fn read_headers(buf: &mut Bytes) -> Result<RpcHeaders, ProtocolError> {
    let mut headers = RpcHeaders::new();
    if buf.is_empty() {
        return Ok(headers);
    }
    let count = get_u16(buf, "arg2 headers")?;
    for _ in 0..count {
        let key = get_str16(buf, "arg2 header key")?;
        let value = get_str16(buf, "arg2 header value")?;
        headers.insert(key, value);
    }
    Ok(headers)
}

/// Fail when `buf` still holds bytes after `stage`.
pub fn ensure_empty(buf: &[u8], stage: &str) -> Result<(), ProtocolError> {
    if buf.is_empty() {
        return Ok(());
    }
    let hex = buf
        .iter()
        .take(MAX_RESIDUAL_HEX_BYTES)
        .map(|b| format!("{b:02x}"))
        .collect();
    Err(ProtocolError::TrailingBytes {
        stage: stage.to_string(),
        hex,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_survive_the_wire() {
        let headers = RpcHeaders::from([
            ("x-uuid".to_string(), "abc".to_string()),
            ("X-Env".to_string(), "canary".to_string()),
        ]);
        let mut bytes = write_headers(&headers).unwrap();
        assert_eq!(read_headers(&mut bytes).unwrap(), headers);
        assert!(bytes.is_empty());
    }

    #[test]
    fn empty_arg2_is_no_headers() {
        assert!(read_headers(&mut Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn residue_is_reported_in_hex() {
        let mut bytes = write_headers(&RpcHeaders::new()).unwrap().to_vec();
        bytes.extend_from_slice(&[0xde, 0xad]);
        let mut bytes = Bytes::from(bytes);
        read_headers(&mut bytes).unwrap();
        let err = ensure_empty(&bytes, "reading response headers").unwrap_err();
        assert_eq!(
            err.to_string(),
            "found unexpected bytes after reading response headers, found (upto 128 bytes): dead"
        );
    }

    #[test]
    fn residue_hex_is_capped() {
        let err = ensure_empty(&[0u8; 200], "body").unwrap_err();
        let ProtocolError::TrailingBytes { hex, .. } = err else {
            panic!("expected trailing bytes");
        };
        assert_eq!(hex.len(), 256);
    }
}
