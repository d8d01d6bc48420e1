//! Connection and channel handles of the in-memory broker.

use super::broker::BrokerState;
use crate::error::BrokerError;
use crate::events::{CloseReason, TransportEvent};
use crate::message::{ConsumeOptions, ExchangeKind, MessageProperties, QueueOptions};
use crate::ports::{Channel, Connection, Consumer};
use crate::EVENT_CHANNEL_CAPACITY;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

pub(crate) struct ConnectionInner {
    pub(crate) id: u64,
    open: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
    channels: Mutex<HashMap<u64, Arc<ChannelInner>>>,
}

impl ConnectionInner {
    pub(crate) fn new(id: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            open: AtomicBool::new(true),
            events,
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        // No subscribers is fine: events are advisory
        let _ = self.events.send(event);
    }

    pub(crate) fn take_channels(&self) -> Vec<Arc<ChannelInner>> {
        self.channels.lock().drain().map(|(_, c)| c).collect()
    }

    pub(crate) fn remove_channel(&self, channel_id: u64) -> Option<Arc<ChannelInner>> {
        self.channels.lock().remove(&channel_id)
    }

    pub(crate) fn channel_ids(&self) -> Vec<u64> {
        self.channels.lock().keys().copied().collect()
    }
}

pub(crate) struct ChannelInner {
    id: u64,
    connection_id: u64,
    open: AtomicBool,
    events: broadcast::Sender<TransportEvent>,
}

impl ChannelInner {
    fn new(id: u64, connection_id: u64) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            id,
            connection_id,
            open: AtomicBool::new(true),
            events,
        }
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

/// Connection to an [`InMemoryBroker`](super::InMemoryBroker).
pub struct MemoryConnection {
    inner: Arc<ConnectionInner>,
    state: Arc<BrokerState>,
}

impl MemoryConnection {
    pub(crate) fn new(inner: Arc<ConnectionInner>, state: Arc<BrokerState>) -> Self {
        Self { inner, state }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn open_channel(&self) -> Result<Arc<dyn Channel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed);
        }

        let channel = Arc::new(ChannelInner::new(self.state.next_id(), self.inner.id));
        self.inner.channels.lock().insert(channel.id, channel.clone());
        debug!(
            connection_id = self.inner.id,
            channel_id = channel.id,
            "Channel opened"
        );

        Ok(Arc::new(MemoryChannel {
            inner: channel,
            state: self.state.clone(),
        }))
    }

    async fn close(&self, reason: CloseReason) -> Result<(), BrokerError> {
        if self.state.close_connection(self.inner.id, reason) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }
}

/// Channel on a [`MemoryConnection`].
pub struct MemoryChannel {
    inner: Arc<ChannelInner>,
    state: Arc<BrokerState>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.inner.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::SeqCst)
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state
            .declare_queue(self.inner.connection_id, name, options)
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.delete_queue(name);
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.declare_exchange(name, kind)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.bind_queue(queue, exchange, routing_key)
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, BrokerError> {
        self.ensure_open()?;
        self.state
            .consume(self.inner.connection_id, self.inner.id, queue, options)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state
            .publish(exchange, routing_key, body, properties)
            .map(|_| ())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self
            .state
            .close_channel(self.inner.connection_id, self.inner.id, CloseReason::normal())
        {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }
}
