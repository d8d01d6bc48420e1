//! RPC error types.
//!
//! Transport failures never show up here while a call is in flight: the
//! supervisor absorbs them. These errors are per call.

use mq_broker::BrokerError;
use std::time::Duration;
use thiserror::Error;

/// Error delivered to a single RPC caller.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError {
    /// No live channel, and none became available within the connect wait.
    #[error("Not connected to broker ({state})")]
    NotConnected { state: String },

    /// The request could not be published.
    #[error("Publish failed: {0}")]
    Publish(#[from] BrokerError),

    /// The request payload could not be encoded.
    #[error("Failed to encode request: {0}")]
    Serialize(String),

    /// The reply body could not be decoded.
    #[error("Failed to decode reply: {0}")]
    Deserialize(String),

    /// No reply arrived before the call's deadline.
    #[error("No reply within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A call with this correlation id is already pending.
    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelationId(String),

    /// A caller-supplied correlation id is unusable.
    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    /// Declaring or consuming the reply queue failed.
    #[error("Reply queue setup failed: {0}")]
    ReplyQueue(String),

    /// Declaring, binding or consuming a worker queue failed.
    #[error("Queue setup failed: {0}")]
    Setup(String),

    /// The client was shut down while the call was pending.
    #[error("RPC client shut down")]
    Shutdown,

    /// The reply stream ended before a reply arrived.
    #[error("Call cancelled before a reply arrived")]
    Cancelled,
}

impl RpcError {
    /// Short label used for metrics.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::NotConnected { .. } => "not_connected",
            Self::Publish(e) if e.is_transport() => "transport",
            Self::Publish(_) => "publish",
            Self::Serialize(_) => "serialize",
            Self::Deserialize(_) => "deserialize",
            Self::Timeout(_) => "timeout",
            Self::DuplicateCorrelationId(_) | Self::InvalidCorrelationId(_) => "correlation_id",
            Self::ReplyQueue(_) => "reply_queue",
            Self::Setup(_) => "setup",
            Self::Shutdown => "shutdown",
            Self::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display() {
        let err = RpcError::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "No reply within 1500ms");
    }

    #[test]
    fn test_from_broker_error() {
        let err: RpcError = BrokerError::ChannelClosed.into();
        assert_eq!(err, RpcError::Publish(BrokerError::ChannelClosed));
        assert_eq!(err.reason(), "transport");

        let err = RpcError::Publish(BrokerError::ExchangeNotFound("rpc".into()));
        assert_eq!(err.reason(), "publish");
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(RpcError::Deserialize("eof".into()).reason(), "deserialize");
        assert_eq!(
            RpcError::NotConnected {
                state: "reconnecting".into()
            }
            .reason(),
            "not_connected"
        );
    }
}
