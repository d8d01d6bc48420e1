//! Message body encoding.

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Turns payloads into message bodies and back.
pub trait Codec: Send + Sync {
    /// Value for the `content_type` message property
    fn content_type(&self) -> &str;

    fn encode(&self, value: &Value) -> Result<Bytes, CodecError>;

    fn decode(&self, body: &[u8]) -> Result<Value, CodecError>;
}
