//! Broker error types.

use crate::events::reply_codes;
use thiserror::Error;

/// Errors returned by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The broker could not be reached.
    #[error("Failed to connect to {address}: {reason}")]
    Dial { address: String, reason: String },

    /// The connection is no longer open.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The channel is no longer open.
    #[error("Channel closed")]
    ChannelClosed,

    /// The named queue does not exist.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// The named exchange does not exist.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// An exclusive queue is owned by another connection.
    #[error("Queue {0} is locked by another connection")]
    ResourceLocked(String),

    /// A redeclaration does not match the existing entity.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// The operation is not permitted (e.g. redeclaring the default exchange).
    #[error("Access refused: {0}")]
    AccessRefused(String),
}

impl BrokerError {
    /// AMQP reply code a real broker would close the channel with.
    #[must_use]
    pub fn reply_code(&self) -> u16 {
        match self {
            Self::Dial { .. } | Self::ConnectionClosed | Self::ChannelClosed => {
                reply_codes::CHANNEL_ERROR
            }
            Self::QueueNotFound(_) | Self::ExchangeNotFound(_) => reply_codes::NOT_FOUND,
            Self::ResourceLocked(_) => reply_codes::RESOURCE_LOCKED,
            Self::PreconditionFailed(_) => reply_codes::PRECONDITION_FAILED,
            Self::AccessRefused(_) => reply_codes::ACCESS_REFUSED,
        }
    }

    /// Whether this error means the transport itself is gone.
    #[must_use]
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Dial { .. } | Self::ConnectionClosed | Self::ChannelClosed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_codes() {
        assert_eq!(BrokerError::QueueNotFound("q".into()).reply_code(), 404);
        assert_eq!(BrokerError::ResourceLocked("q".into()).reply_code(), 405);
        assert_eq!(
            BrokerError::PreconditionFailed("kind".into()).reply_code(),
            406
        );
    }

    #[test]
    fn test_transport_classification() {
        assert!(BrokerError::ChannelClosed.is_transport());
        assert!(BrokerError::ConnectionClosed.is_transport());
        assert!(!BrokerError::ExchangeNotFound("rpc".into()).is_transport());
    }

    #[test]
    fn test_display() {
        let err = BrokerError::Dial {
            address: "amqp://localhost".into(),
            reason: "refused".into(),
        };
        assert_eq!(
            err.to_string(),
            "Failed to connect to amqp://localhost: refused"
        );
    }
}
