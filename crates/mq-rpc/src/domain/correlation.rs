//! Correlation ID for request/reply matching.
//!
//! Generated ids are random (UUID v4) so they cannot be guessed by other
//! publishers on the broker. Callers may supply their own id instead.

use crate::domain::error::RpcError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Longest id that fits an AMQP short string property.
pub const MAX_CORRELATION_ID_LEN: usize = 255;

/// Correlation ID carried in the `correlation_id` message property.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a new random correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Validate a caller-supplied correlation ID.
    pub fn parse(value: &str) -> Result<Self, RpcError> {
        if value.is_empty() {
            return Err(RpcError::InvalidCorrelationId("empty".into()));
        }
        if value.len() > MAX_CORRELATION_ID_LEN {
            return Err(RpcError::InvalidCorrelationId(format!(
                "{} bytes exceeds {}",
                value.len(),
                MAX_CORRELATION_ID_LEN
            )));
        }
        Ok(Self(value.to_string()))
    }

    /// Wrap an id read off the wire without validation.
    pub(crate) fn from_wire(value: &str) -> Self {
        Self(value.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.simple().to_string())
    }
}

impl AsRef<str> for CorrelationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_new_correlation_ids_are_unique() {
        let ids: HashSet<CorrelationId> = (0..1000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_generated_format() {
        let id = CorrelationId::new();
        assert_eq!(id.as_str().len(), 32);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_parse_caller_supplied() {
        let id = CorrelationId::parse("order-42").unwrap();
        assert_eq!(id.to_string(), "order-42");
    }

    #[test]
    fn test_parse_rejects_empty_and_oversized() {
        assert!(matches!(
            CorrelationId::parse(""),
            Err(RpcError::InvalidCorrelationId(_))
        ));
        let long = "x".repeat(MAX_CORRELATION_ID_LEN + 1);
        assert!(CorrelationId::parse(&long).is_err());
        assert!(CorrelationId::parse(&"x".repeat(MAX_CORRELATION_ID_LEN)).is_ok());
    }

    #[test]
    fn test_serde_transparent() {
        let id = CorrelationId::parse("abc").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc\"");
    }
}
