//! Wire frames for the binary RPC transport.
//!
//! Every frame travels inside a `LengthDelimitedCodec` envelope (u32
//! big-endian length). The payload starts with a one-byte frame type.
//!
//! ```text
//! call-request  0x03 | id u32 | ttl_ms u32 | service str16 | method str16
//!                    | transport headers (count u16, str16 pairs)
//!                    | arg2 bytes32 | arg3 bytes32
//! call-response 0x04 | id u32 | flags u8 (0x01 = application error)
//!                    | arg2 bytes32 | arg3 bytes32
//! error         0xff | id u32 | code u8 | message str16
//! ```

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::rpc::errors::{ProtocolError, SystemError, SystemErrorCode};
use crate::rpc::headers::ensure_empty;

const TYPE_CALL_REQUEST: u8 = 0x03;
const TYPE_CALL_RESPONSE: u8 = 0x04;
const TYPE_ERROR: u8 = 0xff;

const FLAG_APPLICATION_ERROR: u8 = 0x01;

/// Transport header keys carried on call requests.
pub mod transport_headers {
    pub const ROUTING_KEY: &str = "rk";
    pub const SHARD_KEY: &str = "sk";
    pub const ROUTING_DELEGATE: &str = "rd";
    pub const CALLER_NAME: &str = "cn";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequest {
    pub id: u32,
    pub ttl: Duration,
    pub service: String,
    /// `Service::method`
    pub method: String,
    pub transport_headers: BTreeMap<String, String>,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallResponse {
    pub id: u32,
    pub application_error: bool,
    pub arg2: Bytes,
    pub arg3: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    pub id: u32,
    pub code: SystemErrorCode,
    pub message: String,
}

impl ErrorFrame {
    pub fn into_system_error(self) -> SystemError {
        SystemError::new(self.code, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    CallRequest(CallRequest),
    CallResponse(CallResponse),
    Error(ErrorFrame),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::CallRequest(_) => "call-request",
            Frame::CallResponse(_) => "call-response",
            Frame::Error(_) => "error",
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        match self {
            Frame::CallRequest(req) => {
                buf.put_u8(TYPE_CALL_REQUEST);
                buf.put_u32(req.id);
                buf.put_u32(u32::try_from(req.ttl.as_millis()).unwrap_or(u32::MAX));
                put_str16(&mut buf, &req.service, "service name")?;
                put_str16(&mut buf, &req.method, "method name")?;
                put_u16_len(&mut buf, req.transport_headers.len(), "transport headers")?;
                for (key, value) in &req.transport_headers {
                    put_str16(&mut buf, key, "transport header key")?;
                    put_str16(&mut buf, value, "transport header value")?;
                }
                put_bytes32(&mut buf, &req.arg2, "arg2")?;
                put_bytes32(&mut buf, &req.arg3, "arg3")?;
            }
            Frame::CallResponse(res) => {
                buf.put_u8(TYPE_CALL_RESPONSE);
                buf.put_u32(res.id);
                buf.put_u8(if res.application_error {
                    FLAG_APPLICATION_ERROR
                } else {
                    0
                });
                put_bytes32(&mut buf, &res.arg2, "arg2")?;
                put_bytes32(&mut buf, &res.arg3, "arg3")?;
            }
            Frame::Error(err) => {
                buf.put_u8(TYPE_ERROR);
                buf.put_u32(err.id);
                buf.put_u8(err.code.as_u8());
                put_str16(&mut buf, &err.message, "error message")?;
            }
        }
        Ok(buf.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        let frame = match get_u8(&mut buf, "frame type")? {
            TYPE_CALL_REQUEST => {
                let id = get_u32(&mut buf, "call id")?;
                let ttl = Duration::from_millis(u64::from(get_u32(&mut buf, "ttl")?));
                let service = get_str16(&mut buf, "service name")?;
                let method = get_str16(&mut buf, "method name")?;
                let count = get_u16(&mut buf, "transport headers")?;
                let mut transport_headers = BTreeMap::new();
                for _ in 0..count {
                    let key = get_str16(&mut buf, "transport header key")?;
                    let value = get_str16(&mut buf, "transport header value")?;
                    transport_headers.insert(key, value);
                }
                let arg2 = get_bytes32(&mut buf, "arg2")?;
                let arg3 = get_bytes32(&mut buf, "arg3")?;
                Frame::CallRequest(CallRequest {
                    id,
                    ttl,
                    service,
                    method,
                    transport_headers,
                    arg2,
                    arg3,
                })
            }
            TYPE_CALL_RESPONSE => {
                let id = get_u32(&mut buf, "call id")?;
                let flags = get_u8(&mut buf, "flags")?;
                let arg2 = get_bytes32(&mut buf, "arg2")?;
                let arg3 = get_bytes32(&mut buf, "arg3")?;
                Frame::CallResponse(CallResponse {
                    id,
                    application_error: flags & FLAG_APPLICATION_ERROR != 0,
                    arg2,
                    arg3,
                })
            }
            TYPE_ERROR => {
                let id = get_u32(&mut buf, "call id")?;
                let code = SystemErrorCode::from_u8(get_u8(&mut buf, "error code")?);
                let message = get_str16(&mut buf, "error message")?;
                Frame::Error(ErrorFrame { id, code, message })
            }
            other => return Err(ProtocolError::UnknownFrameType(other)),
        };
        ensure_empty(&buf, "frame")?;
        Ok(frame)
    }
}

pub(crate) fn put_u16_len(buf: &mut BytesMut, len: usize, what: &'static str) -> Result<(), ProtocolError> {
    let len = u16::try_from(len).map_err(|_| ProtocolError::TooLong { what, len })?;
    buf.put_u16(len);
    Ok(())
}

pub(crate) fn put_str16(buf: &mut BytesMut, value: &str, what: &'static str) -> Result<(), ProtocolError> {
    put_u16_len(buf, value.len(), what)?;
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn put_bytes32(buf: &mut BytesMut, value: &[u8], what: &'static str) -> Result<(), ProtocolError> {
    let len = u32::try_from(value.len()).map_err(|_| ProtocolError::TooLong {
        what,
        len: value.len(),
    })?;
    buf.put_u32(len);
    buf.put_slice(value);
    Ok(())
}

pub(crate) fn get_u8(buf: &mut Bytes, what: &'static str) -> Result<u8, ProtocolError> {
    if buf.remaining() < 1 {
        return Err(ProtocolError::Truncated { what });
    }
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut Bytes, what: &'static str) -> Result<u16, ProtocolError> {
    if buf.remaining() < 2 {
        return Err(ProtocolError::Truncated { what });
    }
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut Bytes, what: &'static str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Truncated { what });
    }
    Ok(buf.get_u32())
}

pub(crate) fn get_str16(buf: &mut Bytes, what: &'static str) -> Result<String, ProtocolError> {
    let len = usize::from(get_u16(buf, what)?);
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated { what });
    }
    String::from_utf8(buf.split_to(len).to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { what })
}

fn get_bytes32(buf: &mut Bytes, what: &'static str) -> Result<Bytes, ProtocolError> {
    let len = get_u32(buf, what)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::Truncated { what });
    }
    Ok(buf.split_to(len))
}
