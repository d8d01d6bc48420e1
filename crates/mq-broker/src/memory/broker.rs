//! Broker state, routing and fault injection.

use super::connection::{ChannelInner, ConnectionInner, MemoryConnection};
use crate::error::BrokerError;
use crate::events::{CloseReason, TransportEvent};
use crate::message::{ConsumeOptions, Delivery, ExchangeKind, MessageProperties, QueueOptions};
use crate::ports::{Broker, Connection, Consumer};
use crate::DEFAULT_EXCHANGE;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// One consumer attached to a queue.
struct ConsumerSlot {
    tag: String,
    connection_id: u64,
    channel_id: u64,
    sender: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    /// Owning connection for exclusive queues
    exclusive_owner: Option<u64>,
    auto_delete: bool,
    /// Set once the first consumer attaches (auto-delete only fires after that)
    had_consumers: bool,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    backlog: VecDeque<Delivery>,
}

impl QueueState {
    fn new(owner: Option<u64>, auto_delete: bool) -> Self {
        Self {
            exclusive_owner: owner,
            auto_delete,
            had_consumers: false,
            consumers: Vec::new(),
            next_consumer: 0,
            backlog: VecDeque::new(),
        }
    }

    /// Hand a delivery to the next live consumer, or park it in the backlog.
    fn deliver(&mut self, mut delivery: Delivery) {
        while !self.consumers.is_empty() {
            let idx = self.next_consumer % self.consumers.len();
            match self.consumers[idx].sender.send(delivery) {
                Ok(()) => {
                    self.next_consumer = idx + 1;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Receiver dropped: consumer is gone
                    self.consumers.remove(idx);
                    delivery = returned;
                }
            }
        }
        self.backlog.push_back(delivery);
    }

    fn is_abandoned(&self) -> bool {
        self.auto_delete && self.had_consumers && self.consumers.is_empty()
    }
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

/// Shared state behind every handle of one broker.
pub(crate) struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    exchanges: RwLock<HashMap<String, ExchangeState>>,
    connections: Mutex<HashMap<u64, Arc<ConnectionInner>>>,
    next_id: AtomicU64,
    next_delivery_tag: AtomicU64,
    reachable: AtomicBool,
    pending_dial_failures: AtomicU32,
    dials: AtomicU64,
    published: AtomicU64,
    unroutable: AtomicU64,
}

impl BrokerState {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            exchanges: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            next_delivery_tag: AtomicU64::new(1),
            reachable: AtomicBool::new(true),
            pending_dial_failures: AtomicU32::new(0),
            dials: AtomicU64::new(0),
            published: AtomicU64::new(0),
            unroutable: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn connection(&self, id: u64) -> Option<Arc<ConnectionInner>> {
        self.connections.lock().get(&id).cloned()
    }

    pub(crate) fn declare_queue(
        &self,
        connection_id: u64,
        name: &str,
        options: QueueOptions,
    ) -> Result<(), BrokerError> {
        let mut queues = self.queues.lock();
        if let Some(existing) = queues.get(name) {
            return match existing.exclusive_owner {
                Some(owner) if owner != connection_id => {
                    Err(BrokerError::ResourceLocked(name.to_string()))
                }
                _ => Ok(()),
            };
        }

        let owner = options.exclusive.then_some(connection_id);
        queues.insert(name.to_string(), QueueState::new(owner, options.auto_delete));
        debug!(
            queue = name,
            exclusive = options.exclusive,
            auto_delete = options.auto_delete,
            "Queue declared"
        );
        Ok(())
    }

    pub(crate) fn delete_queue(&self, name: &str) -> bool {
        let removed = self.queues.lock().remove(name).is_some();
        if removed {
            self.unbind_all(&[name.to_string()]);
            debug!(queue = name, "Queue deleted");
        }
        removed
    }

    pub(crate) fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        if name == DEFAULT_EXCHANGE {
            return Err(BrokerError::AccessRefused(
                "the default exchange cannot be declared".into(),
            ));
        }

        let mut exchanges = self.exchanges.write();
        match exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(BrokerError::PreconditionFailed(
                format!("exchange {} already declared as {:?}", name, existing.kind),
            )),
            Some(_) => Ok(()),
            None => {
                exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                debug!(exchange = name, kind = ?kind, "Exchange declared");
                Ok(())
            }
        }
    }

    pub(crate) fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        if !self.queues.lock().contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }

        let mut exchanges = self.exchanges.write();
        let state = exchanges
            .get_mut(exchange)
            .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;

        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn consume(
        &self,
        connection_id: u64,
        channel_id: u64,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<Consumer, BrokerError> {
        let mut queues = self.queues.lock();
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        if let Some(owner) = state.exclusive_owner {
            if owner != connection_id {
                return Err(BrokerError::ResourceLocked(queue.to_string()));
            }
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let tag = format!("ctag-{}", self.next_id());

        // Flush messages that arrived while nobody was listening
        while let Some(delivery) = state.backlog.pop_front() {
            // Receiver is held locally, send cannot fail
            let _ = sender.send(delivery);
        }

        state.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            connection_id,
            channel_id,
            sender,
        });
        state.had_consumers = true;

        debug!(queue = queue, consumer_tag = %tag, no_ack = options.no_ack, "Consumer attached");
        Ok(Consumer::new(tag, queue, receiver))
    }

    pub(crate) fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<usize, BrokerError> {
        self.published.fetch_add(1, Ordering::Relaxed);

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            vec![routing_key.to_string()]
        } else {
            let exchanges = self.exchanges.read();
            let state = exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::ExchangeNotFound(exchange.to_string()))?;
            state
                .bindings
                .iter()
                .filter(|b| state.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
                .map(|b| b.queue.clone())
                .collect()
        };

        let mut queues = self.queues.lock();
        let mut routed = 0;
        for name in targets {
            let Some(queue) = queues.get_mut(&name) else {
                continue;
            };
            queue.deliver(Delivery {
                delivery_tag: self.next_delivery_tag.fetch_add(1, Ordering::Relaxed),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                properties: properties.clone(),
            });
            routed += 1;
        }

        if routed == 0 {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!(
                exchange = exchange,
                routing_key = routing_key,
                "Message unroutable, dropped"
            );
        }
        Ok(routed)
    }

    /// Tear down a connection, its channels, consumers and exclusive queues.
    pub(crate) fn close_connection(&self, connection_id: u64, reason: CloseReason) -> bool {
        let Some(connection) = self.connections.lock().remove(&connection_id) else {
            return false;
        };
        connection.mark_closed();
        let channels: Vec<Arc<ChannelInner>> = connection.take_channels();

        let dropped = {
            let mut queues = self.queues.lock();
            for queue in queues.values_mut() {
                queue.consumers.retain(|c| c.connection_id != connection_id);
            }
            let dropped: Vec<String> = queues
                .iter()
                .filter(|(_, q)| q.exclusive_owner == Some(connection_id) || q.is_abandoned())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &dropped {
                queues.remove(name);
            }
            dropped
        };
        self.unbind_all(&dropped);

        info!(
            connection_id = connection_id,
            code = reason.code,
            reason = %reason.text,
            queues_dropped = dropped.len(),
            "Connection closed"
        );

        // Connection first, so observers see the root cause before channel fallout
        connection.emit(TransportEvent::Closed(reason.clone()));
        for channel in channels {
            channel.mark_closed();
            channel.emit(TransportEvent::Closed(reason.clone()));
        }
        true
    }

    /// Tear down one channel and its consumers.
    pub(crate) fn close_channel(&self, connection_id: u64, channel_id: u64, reason: CloseReason) -> bool {
        let Some(connection) = self.connection(connection_id) else {
            return false;
        };
        let Some(channel) = connection.remove_channel(channel_id) else {
            return false;
        };
        channel.mark_closed();

        let dropped = {
            let mut queues = self.queues.lock();
            for queue in queues.values_mut() {
                queue.consumers.retain(|c| c.channel_id != channel_id);
            }
            let dropped: Vec<String> = queues
                .iter()
                .filter(|(_, q)| q.is_abandoned())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &dropped {
                queues.remove(name);
            }
            dropped
        };
        self.unbind_all(&dropped);

        debug!(
            connection_id = connection_id,
            channel_id = channel_id,
            code = reason.code,
            "Channel closed"
        );
        channel.emit(TransportEvent::Closed(reason));
        true
    }

    fn unbind_all(&self, queues: &[String]) {
        if queues.is_empty() {
            return;
        }
        let mut exchanges = self.exchanges.write();
        for exchange in exchanges.values_mut() {
            exchange.bindings.retain(|b| !queues.contains(&b.queue));
        }
    }
}

/// In-memory broker handle. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState::new()),
        }
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Make the broker (un)reachable for new dials.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `count` dial attempts.
    pub fn fail_next_dials(&self, count: u32) {
        self.state.pending_dial_failures.store(count, Ordering::SeqCst);
    }

    /// Close every open connection with `reason`. Returns how many were closed.
    pub fn force_close_connections(&self, reason: CloseReason) -> usize {
        let ids: Vec<u64> = self.state.connections.lock().keys().copied().collect();
        warn!(
            connections = ids.len(),
            code = reason.code,
            "Forcing connections closed"
        );
        ids.into_iter()
            .filter(|id| self.state.close_connection(*id, reason.clone()))
            .count()
    }

    /// Close every open channel with `reason`, leaving connections up.
    pub fn force_close_channels(&self, reason: CloseReason) -> usize {
        let connections: Vec<Arc<ConnectionInner>> =
            self.state.connections.lock().values().cloned().collect();
        let mut closed = 0;
        for connection in connections {
            for channel_id in connection.channel_ids() {
                if self
                    .state
                    .close_channel(connection.id, channel_id, reason.clone())
                {
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Report a non-terminal error on every open connection.
    pub fn emit_connection_error(&self, message: &str) {
        let connections: Vec<Arc<ConnectionInner>> =
            self.state.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.emit(TransportEvent::Error(message.to_string()));
        }
    }

    /// Publish without going through a connection (e.g. a remote worker).
    pub fn inject(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<usize, BrokerError> {
        self.state.publish(exchange, routing_key, body, properties)
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Total dial attempts, successful or not.
    pub fn dial_count(&self) -> u64 {
        self.state.dials.load(Ordering::Relaxed)
    }

    pub fn open_connections(&self) -> usize {
        self.state.connections.lock().len()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.state.queues.lock().contains_key(name)
    }

    /// Messages waiting in a queue with no consumer.
    pub fn queue_depth(&self, name: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(name)
            .map_or(0, |q| q.backlog.len())
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.state
            .queues
            .lock()
            .get(name)
            .map_or(0, |q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
    }

    /// Consumer tags attached to a queue.
    pub fn consumer_tags(&self, name: &str) -> Vec<String> {
        self.state
            .queues
            .lock()
            .get(name)
            .map(|q| q.consumers.iter().map(|c| c.tag.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.queues.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn published_count(&self) -> u64 {
        self.state.published.load(Ordering::Relaxed)
    }

    pub fn unroutable_count(&self) -> u64 {
        self.state.unroutable.load(Ordering::Relaxed)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn dial(&self, address: &str) -> Result<Arc<dyn Connection>, BrokerError> {
        self.state.dials.fetch_add(1, Ordering::Relaxed);

        if address.is_empty() {
            return Err(BrokerError::Dial {
                address: address.to_string(),
                reason: "empty address".into(),
            });
        }

        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Dial {
                address: address.to_string(),
                reason: "connection refused".into(),
            });
        }

        let injected_failure = self
            .state
            .pending_dial_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            return Err(BrokerError::Dial {
                address: address.to_string(),
                reason: "connection reset by peer".into(),
            });
        }

        let inner = Arc::new(ConnectionInner::new(self.state.next_id()));
        self.state.connections.lock().insert(inner.id, inner.clone());
        debug!(connection_id = inner.id, address = address, "Connection opened");

        Ok(Arc::new(MemoryConnection::new(inner, self.state.clone())))
    }
}
