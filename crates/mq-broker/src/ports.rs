//! # Broker Ports
//!
//! Traits a broker client must implement for the RPC core. Connections and
//! channels are handed around as `Arc<dyn ...>` so a supervisor can own them
//! and lend them to listeners.

use crate::error::BrokerError;
use crate::events::{CloseReason, TransportEvent};
use crate::message::{ConsumeOptions, Delivery, ExchangeKind, MessageProperties, QueueOptions};
use async_trait::async_trait;
use bytes::Bytes;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::Stream;

/// Entry point of a broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a connection to the broker at `address`.
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, BrokerError>;
}

/// A live link to the broker.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Connection identifier, unique per broker.
    fn id(&self) -> u64;

    /// Whether the connection is still open.
    fn is_open(&self) -> bool;

    /// Subscribe to error/close events of this connection.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Open a multiplexed channel on this connection.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError>;

    /// Close the connection and every channel on it.
    async fn close(&self, reason: CloseReason) -> Result<(), BrokerError>;
}

/// A logical session on a connection, used for all queue operations.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel identifier, unique per broker.
    fn id(&self) -> u64;

    /// Whether the channel is still open.
    fn is_open(&self) -> bool;

    /// Subscribe to error/close events of this channel.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Declare a queue. Redeclaring with the same owner is a no-op.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Delete a queue, ending all of its consumers.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Declare an exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Bind `queue` to `exchange` under `routing_key`.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue`.
    async fn consume(&self, queue: &str, options: ConsumeOptions)
        -> Result<Consumer, BrokerError>;

    /// Publish a body to `exchange` with `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<(), BrokerError>;

    /// Close the channel.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// Stream of deliveries for one consumer.
///
/// Yields `None` once the consumer is cancelled (queue deleted, channel or
/// connection closed).
pub struct Consumer {
    tag: String,
    queue: String,
    receiver: mpsc::UnboundedReceiver<Delivery>,
}

impl Consumer {
    pub fn new(
        tag: impl Into<String>,
        queue: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        Self {
            tag: tag.into(),
            queue: queue.into(),
            receiver,
        }
    }

    /// Consumer tag assigned by the broker.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Queue being consumed.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Receive the next delivery, or `None` when the consumer is cancelled.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("tag", &self.tag)
            .field("queue", &self.queue)
            .finish()
    }
}
