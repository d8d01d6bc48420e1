//! Outgoing RPC request.

use crate::domain::correlation::CorrelationId;
use serde_json::Value;
use std::time::Duration;

/// Deadline for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CallTimeout {
    /// Use the client's configured default
    #[default]
    Default,
    /// Fail the call after this long
    After(Duration),
    /// Wait for a reply indefinitely
    Never,
}

impl CallTimeout {
    /// Resolve against the client default.
    #[must_use]
    pub fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Self::Default => default,
            Self::After(timeout) => Some(timeout),
            Self::Never => None,
        }
    }
}

/// A request to publish to `exchange` with `routing_key`.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Value,
    /// Caller-supplied correlation id; generated when `None`
    pub correlation_id: Option<CorrelationId>,
    pub timeout: CallTimeout,
}

impl RpcRequest {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>, payload: Value) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload,
            correlation_id: None,
            timeout: CallTimeout::Default,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = CallTimeout::After(timeout);
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = CallTimeout::Never;
        self
    }
}
