//! RPC correlation engine.
//!
//! One shared, exclusive reply queue per connection. Requests carry a
//! correlation id and the reply queue as reply-to; a single consumer loop
//! per channel matches replies to pending calls by id, in delivery order.

use crate::adapters::JsonCodec;
use crate::domain::completion::Completion;
use crate::domain::config::{ClientConfig, ConfigError, RpcConfig};
use crate::domain::correlation::CorrelationId;
use crate::domain::error::RpcError;
use crate::domain::pending::{PendingCall, PendingCallTable, PendingStats, PendingStatsSnapshot};
use crate::domain::request::RpcRequest;
use crate::domain::state::ConnectionState;
use crate::ports::{Codec, ConnectionListener};
use crate::supervisor::{wait_until_connected, ConnectionSupervisor, SupervisorHandle};
use async_trait::async_trait;
use mq_broker::{Broker, Channel, ConsumeOptions, Consumer, Delivery, MessageProperties, QueueOptions};
use mq_telemetry::metrics::record_failure;
use mq_telemetry::{RPC_CALLS_SENT, RPC_CALL_DURATION, RPC_PENDING_CALLS, RPC_REPLIES_MATCHED, RPC_REPLIES_UNMATCHED};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Channel and reply queue the client is currently bound to.
#[derive(Clone)]
struct ReplyBinding {
    channel: Arc<dyn Channel>,
    reply_queue: String,
    generation: u64,
}

struct ClientInner {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    pending: PendingCallTable,
    binding: RwLock<Option<ReplyBinding>>,
    generation: AtomicU64,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
}

/// RPC client. Clones share the same pending table and binding.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Client that follows `state` for connectivity. It must also be added
    /// as a listener to the supervisor that owns `state`.
    pub fn new(config: ClientConfig, state: watch::Receiver<ConnectionState>) -> Self {
        Self::with_codec(config, state, Arc::new(JsonCodec))
    }

    pub fn with_codec(
        config: ClientConfig,
        state: watch::Receiver<ConnectionState>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                codec,
                pending: PendingCallTable::new(),
                binding: RwLock::new(None),
                generation: AtomicU64::new(0),
                state,
                shutdown,
            }),
        }
    }

    /// Validate `config`, start a supervisor with this client registered,
    /// and start the timeout sweep.
    pub fn start(
        broker: Arc<dyn Broker>,
        config: RpcConfig,
    ) -> Result<(Self, SupervisorHandle), ConfigError> {
        config.validate()?;

        let mut supervisor = ConnectionSupervisor::new(broker, config.supervisor);
        let client = Self::new(config.client, supervisor.subscribe());
        supervisor.add_listener(Arc::new(client.clone()));
        client.spawn_sweeper();

        Ok((client, supervisor.spawn()))
    }

    /// Publish a request. `completion` is invoked exactly once when the
    /// reply is handled or the call times out. Errors returned here mean
    /// the completion will never run.
    pub async fn send(
        &self,
        request: RpcRequest,
        completion: Completion,
    ) -> Result<CorrelationId, RpcError> {
        let binding = self.ready_binding().await.inspect_err(|e| {
            record_failure(e.reason());
        })?;

        let body = self
            .inner
            .codec
            .encode(&request.payload)
            .map_err(|e| RpcError::Serialize(e.to_string()))?;

        let correlation_id = request.correlation_id.unwrap_or_default();
        let timeout = request.timeout.resolve(self.inner.config.default_timeout);

        self.inner.pending.register(
            correlation_id.clone(),
            PendingCall::new(completion, timeout, &request.exchange, &request.routing_key),
        )?;
        self.update_pending_gauge();

        let properties = MessageProperties::new()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(binding.reply_queue.as_str())
            .with_content_type(self.inner.codec.content_type());

        if let Err(e) = binding
            .channel
            .publish(&request.exchange, &request.routing_key, body, properties)
            .await
        {
            self.inner.pending.cancel(&correlation_id);
            self.update_pending_gauge();
            warn!(
                correlation_id = %correlation_id,
                exchange = %request.exchange,
                routing_key = %request.routing_key,
                code = e.reply_code(),
                transport = e.is_transport(),
                error = %e,
                "Failed to publish request"
            );
            let err = RpcError::Publish(e);
            record_failure(err.reason());
            return Err(err);
        }

        RPC_CALLS_SENT.inc();
        debug!(
            correlation_id = %correlation_id,
            exchange = %request.exchange,
            routing_key = %request.routing_key,
            reply_to = %binding.reply_queue,
            "Sent RPC request"
        );
        Ok(correlation_id)
    }

    /// Send a request and wait for its reply.
    pub async fn call(&self, request: RpcRequest) -> Result<Value, RpcError> {
        let (completion, rx) = Completion::channel();
        self.send(request, completion).await?;
        rx.await.unwrap_or(Err(RpcError::Cancelled))
    }

    /// `call` with serde conversion on both ends.
    pub async fn call_typed<Req, Resp>(
        &self,
        exchange: &str,
        routing_key: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_value(request).map_err(|e| RpcError::Serialize(e.to_string()))?;
        let reply = self
            .call(RpcRequest::new(exchange, routing_key, payload))
            .await?;
        serde_json::from_value(reply).map_err(|e| RpcError::Deserialize(e.to_string()))
    }

    /// Start the background task that fails overdue calls. It stops on
    /// `shutdown` or once the last clone of the client is dropped.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        tokio::spawn(sweep_task(
            Arc::downgrade(&self.inner),
            self.inner.config.sweep_interval,
            self.inner.shutdown.subscribe(),
        ))
    }

    /// Fail every pending call with `RpcError::Shutdown` and stop the
    /// client's background tasks. Later sends fail.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        *self.inner.binding.write() = None;

        let drained = self.inner.pending.drain();
        self.update_pending_gauge();
        info!(failed_calls = drained.len(), "RPC client shut down");
        for (_, call) in drained {
            record_failure("shutdown");
            call.into_completion().fail(RpcError::Shutdown);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.pending_count()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.inner.pending.is_pending(correlation_id)
    }

    pub fn stats(&self) -> PendingStatsSnapshot {
        self.inner.pending.stats().snapshot()
    }

    /// Current reply queue, if bound.
    pub fn reply_queue(&self) -> Option<String> {
        self.inner
            .binding
            .read()
            .as_ref()
            .map(|b| b.reply_queue.clone())
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.borrow().clone()
    }

    /// Evict calls whose deadline passed at `now`. Returns how many failed.
    pub fn expire_overdue(&self, now: Instant) -> usize {
        self.inner.expire_overdue(now)
    }

    async fn ready_binding(&self) -> Result<ReplyBinding, RpcError> {
        if *self.inner.shutdown.borrow() {
            return Err(RpcError::Shutdown);
        }

        let mut state = self.inner.state.clone();
        wait_until_connected(&mut state, self.inner.config.connect_wait).await?;

        self.inner
            .binding
            .read()
            .clone()
            .ok_or_else(|| RpcError::NotConnected {
                state: self.state().to_string(),
            })
    }

    fn update_pending_gauge(&self) {
        RPC_PENDING_CALLS.set(self.inner.pending.pending_count() as f64);
    }
}

#[async_trait]
impl ConnectionListener for RpcClient {
    /// Declare a fresh reply queue on the new channel and start consuming.
    async fn on_connected(&self, channel: Arc<dyn Channel>) -> Result<(), RpcError> {
        if *self.inner.shutdown.borrow() {
            return Err(RpcError::Shutdown);
        }

        let reply_queue = format!(
            "{}{}",
            self.inner.config.reply_queue_prefix,
            Uuid::new_v4().simple()
        );
        channel
            .declare_queue(&reply_queue, QueueOptions::exclusive_auto_delete())
            .await
            .map_err(|e| RpcError::ReplyQueue(e.to_string()))?;
        let consumer = channel
            .consume(&reply_queue, ConsumeOptions::no_ack())
            .await
            .map_err(|e| RpcError::ReplyQueue(e.to_string()))?;

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.binding.write() = Some(ReplyBinding {
            channel,
            reply_queue: reply_queue.clone(),
            generation,
        });

        tokio::spawn(consume_replies(
            Arc::downgrade(&self.inner),
            self.inner.shutdown.subscribe(),
            consumer,
            generation,
        ));
        info!(reply_queue = %reply_queue, generation, "Reply queue bound");
        Ok(())
    }

    fn name(&self) -> &str {
        "rpc-client"
    }
}

impl ClientInner {
    fn handle_reply(&self, delivery: Delivery) {
        let Some(raw_id) = delivery.correlation_id() else {
            debug!(delivery_tag = delivery.delivery_tag, "Reply without correlation id ignored");
            self.record_unmatched();
            return;
        };
        let correlation_id = CorrelationId::from_wire(raw_id);

        let Some(call) = self.pending.take(&correlation_id) else {
            debug!(correlation_id = %correlation_id, "Reply for unknown or expired correlation id");
            self.record_unmatched();
            return;
        };
        RPC_PENDING_CALLS.set(self.pending.pending_count() as f64);

        let elapsed = call.elapsed();
        let routing_key = call.routing_key().to_string();
        match self.codec.decode(&delivery.body) {
            Ok(value) => {
                PendingStats::record(&self.pending.stats().total_completed);
                RPC_REPLIES_MATCHED.inc();
                RPC_CALL_DURATION.observe(elapsed.as_secs_f64());
                debug!(
                    correlation_id = %correlation_id,
                    routing_key = %routing_key,
                    response_time_ms = elapsed.as_millis() as u64,
                    "Completed pending call"
                );
                call.into_completion().succeed(value);
            }
            Err(e) => {
                PendingStats::record(&self.pending.stats().total_failed);
                RPC_REPLIES_MATCHED.inc();
                record_failure("deserialize");
                warn!(
                    correlation_id = %correlation_id,
                    routing_key = %routing_key,
                    error = %e,
                    "Failed to decode reply"
                );
                let completion = call.into_completion();
                if !completion.has_failure_path() {
                    debug!(
                        correlation_id = %correlation_id,
                        "Undecodable reply for a call without a failure path"
                    );
                }
                completion.fail(RpcError::Deserialize(e.to_string()));
            }
        }
    }

    fn record_unmatched(&self) {
        PendingStats::record(&self.pending.stats().total_unmatched);
        RPC_REPLIES_UNMATCHED.inc();
    }

    fn expire_overdue(&self, now: Instant) -> usize {
        let expired = self.pending.remove_expired(now);
        if expired.is_empty() {
            return 0;
        }
        RPC_PENDING_CALLS.set(self.pending.pending_count() as f64);

        let count = expired.len();
        for (correlation_id, call) in expired {
            let timeout = call.timeout().unwrap_or_default();
            record_failure("timeout");
            warn!(
                correlation_id = %correlation_id,
                exchange = %call.exchange(),
                routing_key = %call.routing_key(),
                timeout_ms = timeout.as_millis() as u64,
                "RPC call timed out"
            );
            call.into_completion().fail(RpcError::Timeout(timeout));
        }
        count
    }

    fn is_current(&self, generation: u64) -> bool {
        self.binding
            .read()
            .as_ref()
            .is_some_and(|b| b.generation == generation)
    }
}

/// Reply consumer loop for one channel. Ends when the consumer is
/// cancelled (connection lost), the client shuts down, or the client is
/// dropped.
async fn consume_replies(
    inner: Weak<ClientInner>,
    mut shutdown: watch::Receiver<bool>,
    mut consumer: Consumer,
    generation: u64,
) {
    loop {
        tokio::select! {
            delivery = consumer.recv() => match (delivery, inner.upgrade()) {
                (Some(delivery), Some(inner)) => inner.handle_reply(delivery),
                _ => break,
            },
            // Also fires when the sender is dropped with the client
            _ = shutdown.changed() => break,
        }
    }

    match inner.upgrade() {
        Some(inner) if inner.is_current(generation) => {
            debug!(generation, queue = consumer.queue(), "Reply consumer ended");
        }
        _ => debug!(generation, "Reply consumer for previous connection ended"),
    }
}

async fn sweep_task(
    inner: Weak<ClientInner>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let expired = inner.expire_overdue(Instant::now());
                if expired > 0 {
                    debug!(expired, "Swept expired calls");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
