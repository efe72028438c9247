use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::CodecError;

/// Pluggable serializer for everything that crosses the wire: whole
/// request/response frames as well as individual argument and result blobs.
///
/// Typed values reach the codec as [`serde_json::Value`] trees, so any
/// self-describing format can implement this in a few lines. [`JsonCodec`] is
/// the default.
pub trait Codec: Send + Sync + 'static {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The default wire codec: compact JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::from)
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::from)
    }
}

pub(crate) fn marshal<T: Serialize>(codec: &dyn Codec, value: &T) -> Result<Vec<u8>, CodecError> {
    codec.marshal(&serde_json::to_value(value)?)
}

pub(crate) fn unmarshal<T: DeserializeOwned>(
    codec: &dyn Codec,
    bytes: &[u8],
) -> Result<T, CodecError> {
    serde_json::from_value(codec.unmarshal(bytes)?).map_err(CodecError::from)
}

/// Decodes a value slot, where an empty blob stands for "no value".
pub(crate) fn unmarshal_value(codec: &dyn Codec, bytes: &[u8]) -> Result<Value, CodecError> {
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    codec.unmarshal(bytes)
}
