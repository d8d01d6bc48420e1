//! JSON body codec.

use crate::ports::{Codec, CodecError};
use bytes::Bytes;
use serde_json::Value;

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes payloads as UTF-8 JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, value: &Value) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(body).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode() {
        let codec = JsonCodec;
        let body = codec.encode(&json!({"a": 2, "b": 3})).unwrap();
        assert_eq!(codec.decode(&body).unwrap(), json!({"a": 2, "b": 3}));
    }

    #[test]
    fn test_decode_garbage() {
        let err = JsonCodec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_decode_empty_body() {
        assert!(JsonCodec.decode(b"").is_err());
    }
}
