//! MQ-RPC - Request/response over a publish/consume message broker.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        Connection Supervisor                         │
//! │   dial → open channel → notify listeners → watch events → retry     │
//! └───────────────┬─────────────────────────────────┬────────────────────┘
//!                 │ on_connected(channel)           │ on_connected(channel)
//!                 ▼                                 ▼
//! ┌───────────────────────────────┐   ┌──────────────────────────────────┐
//! │          RpcClient            │   │          RpcResponder            │
//! │  reply queue (exclusive)      │   │  exchange → work queue           │
//! │  pending call table           │   │  handler → reply to reply-to     │
//! │  timeout sweep                │   │                                  │
//! └───────────────┬───────────────┘   └────────────────┬─────────────────┘
//!                 │ publish(correlation_id, reply_to)  │
//!                 └──────────────→ broker ─────────────┘
//! ```
//!
//! # Reconnects
//!
//! The supervisor retries forever with a fixed delay. A connection close
//! outside the [`ClosePolicy`] (by default anything but `320
//! CONNECTION_FORCED`) stops it instead. While reconnecting, `send` waits
//! up to the configured connect wait, then fails with
//! [`RpcError::NotConnected`]. Calls in flight when a connection drops are
//! not replayed; their deadlines fail them.
//!
//! # Usage
//!
//! ```ignore
//! use mq_broker::InMemoryBroker;
//! use mq_rpc::{RpcClient, RpcConfig, RpcRequest};
//!
//! let (client, supervisor) = RpcClient::start(Arc::new(InMemoryBroker::new()), RpcConfig::default())?;
//! let sum = client.call(RpcRequest::new("rpc", "add", json!({"a": 2, "b": 3}))).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod adapters;
pub mod client;
pub mod domain;
pub mod per_call;
pub mod ports;
pub mod responder;
pub mod supervisor;

// Re-export main types
pub use adapters::{FnListener, JsonCodec, StatusSink};
pub use client::RpcClient;
pub use domain::{
    CallTimeout, ClientConfig, ClosePolicy, Completion, ConfigError, ConnectionState,
    CorrelationId, PendingStatsSnapshot, RpcConfig, RpcError, RpcRequest, SupervisorConfig,
};
pub use per_call::PerCallRpc;
pub use ports::{Codec, CodecError, ConnectionListener, ResultSink};
pub use responder::{FnHandler, HandlerError, RequestHandler, RpcResponder};
pub use supervisor::{connect, ConnectionSupervisor, SupervisorHandle, SupervisorStats};

/// How replies find their way back to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplyMode {
    /// One exclusive reply queue per connection, shared by all calls
    #[default]
    Shared,
    /// A fresh reply queue per call, deleted after the call resolves
    PerCall,
}

impl std::str::FromStr for ReplyMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "per-call" | "per_call" | "percall" => Ok(Self::PerCall),
            other => Err(ConfigError::InvalidEnv {
                key: "reply mode".into(),
                value: other.to_string(),
            }),
        }
    }
}
