//! Arg3 body codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("body truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("body too long: {0} bytes")]
    TooLong(usize),
}

/// A request or response struct that can travel as arg3.
///
/// `decode` consumes its own bytes from the front of the buffer; callers
/// check the residue afterwards.
pub trait WireStruct: Sized + Send + Sync {
    fn encode(&self) -> Result<Bytes, CodecError>;

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError>;

    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Any serde type as a u32-length-prefixed JSON document.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonStruct<T>(pub T);

impl<T> JsonStruct<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> WireStruct for JsonStruct<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn encode(&self) -> Result<Bytes, CodecError> {
        let json = serde_json::to_vec(&self.0)?;
        let len = u32::try_from(json.len()).map_err(|_| CodecError::TooLong(json.len()))?;
        let mut buf = BytesMut::with_capacity(4 + json.len());
        buf.put_u32(len);
        buf.put_slice(&json);
        Ok(buf.freeze())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        if buf.remaining() < 4 {
            return Err(CodecError::Truncated {
                need: 4,
                have: buf.remaining(),
            });
        }
        let len = buf.get_u32() as usize;
        if buf.remaining() < len {
            return Err(CodecError::Truncated {
                need: len,
                have: buf.remaining(),
            });
        }
        let json = buf.split_to(len);
        Ok(JsonStruct(serde_json::from_slice(&json)?))
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Arg3 passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawBody(pub Bytes);

impl WireStruct for RawBody {
    fn encode(&self) -> Result<Bytes, CodecError> {
        Ok(self.0.clone())
    }

    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(RawBody(std::mem::take(buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Echo {
        message: String,
    }

    #[test]
    fn decode_leaves_residue_for_caller() {
        let mut bytes = BytesMut::from(
            JsonStruct(Echo {
                message: "hi".into(),
            })
            .encode()
            .unwrap()
            .as_ref(),
        );
        bytes.put_u8(1);
        let mut bytes = bytes.freeze();
        let decoded = JsonStruct::<Echo>::decode(&mut bytes).unwrap();
        assert_eq!(decoded.0.message, "hi");
        assert_eq!(bytes.as_ref(), &[1]);
    }

    #[test]
    fn truncated_body_is_an_error() {
        let mut bytes = Bytes::from_static(&[0, 0, 0, 9, b'{']);
        assert!(matches!(
            JsonStruct::<Echo>::decode(&mut bytes),
            Err(CodecError::Truncated { need: 9, have: 1 })
        ));
    }

    #[test]
    fn type_name_names_inner_type() {
        assert!(<JsonStruct<Echo> as WireStruct>::type_name().ends_with("Echo"));
    }
}
