//! # In-Memory Broker
//!
//! A single-process broker with AMQP-like semantics: the default exchange,
//! direct and fanout exchanges, exclusive and auto-delete queues, and
//! round-robin delivery across competing consumers.
//!
//! Deliveries are never requeued; `no_ack` is accepted but has no effect.
//! Fault injection helpers (`force_close_connections`, `fail_next_dials`,
//! ...) drive the reconnect paths of the RPC core in tests.

mod broker;
mod connection;

pub use broker::InMemoryBroker;
pub use connection::{MemoryChannel, MemoryConnection};
