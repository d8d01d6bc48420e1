//! # MQ Broker - Broker Client Ports
//!
//! The minimal surface of a publish/consume message broker that the RPC
//! core depends on, plus an in-memory implementation used by tests and by
//! the host runtime.
//!
//! ## Model
//!
//! ```text
//! ┌──────────────┐  dial()   ┌──────────────┐ open_channel() ┌──────────────┐
//! │    Broker    │ ────────→ │  Connection  │ ─────────────→ │   Channel    │
//! └──────────────┘           └──────────────┘                └──────────────┘
//!                                   │ events()                      │ events()
//!                                   ▼                               ▼
//!                          TransportEvent::{Error, Closed(CloseReason)}
//! ```
//!
//! A channel declares queues and exchanges, publishes bodies with
//! [`MessageProperties`] (correlation id, reply-to), and consumes queues
//! as a [`Consumer`] stream of [`Delivery`] values.
//!
//! ## Reply Codes
//!
//! Close reasons carry AMQP 0-9-1 reply codes (see [`reply_codes`]).
//! `320 CONNECTION_FORCED` is what a broker sends when it shuts down or an
//! operator kills the connection.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod error;
pub mod events;
pub mod memory;
pub mod message;
pub mod ports;

// Re-export main types
pub use error::BrokerError;
pub use events::{reply_codes, CloseReason, TransportEvent};
pub use memory::InMemoryBroker;
pub use message::{ConsumeOptions, Delivery, ExchangeKind, MessageProperties, QueueOptions};
pub use ports::{Broker, Channel, Connection, Consumer};

/// Name of the default exchange. Publishing to it routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Capacity of the per-connection and per-channel event broadcast.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_exchange_is_empty() {
        assert!(DEFAULT_EXCHANGE.is_empty());
    }
}
