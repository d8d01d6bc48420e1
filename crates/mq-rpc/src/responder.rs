//! Worker side of the RPC pattern.
//!
//! A responder serves one exchange/routing key: it declares a direct
//! exchange and a shared work queue bound to it, decodes each request,
//! runs the handler, and publishes the result to the default exchange with
//! the request's reply-to as routing key and the same correlation id.
//!
//! Register it with a connection supervisor; it rebinds on every
//! reconnect. The work queue is durable across reconnects, so requests
//! published while the worker was away are served once it is back.

use crate::adapters::JsonCodec;
use crate::domain::error::RpcError;
use crate::ports::{Codec, ConnectionListener};
use async_trait::async_trait;
use mq_broker::{
    Channel, ConsumeOptions, Consumer, Delivery, ExchangeKind, MessageProperties, QueueOptions,
    DEFAULT_EXCHANGE,
};
use mq_telemetry::RPC_REQUESTS_SERVED;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Application failure reported by a handler.
///
/// Sent back to the caller as `{"error": "<message>"}`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

/// Handles decoded requests for a responder.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, request: Value) -> Result<Value, HandlerError>;
}

/// Adapter for async closures.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, request: Value) -> Result<Value, HandlerError> {
        (self.0)(request).await
    }
}

/// Responder counters
#[derive(Debug, Default)]
pub struct ResponderStats {
    /// Requests answered with a handler result
    pub served: AtomicU64,
    /// Requests answered with an error body, or whose reply failed
    pub failed: AtomicU64,
    /// Requests dropped for lack of reply-to or correlation id
    pub dropped: AtomicU64,
}

/// Serves RPC requests for one exchange/routing key.
#[derive(Clone)]
pub struct RpcResponder {
    exchange: String,
    routing_key: String,
    queue: String,
    handler: Arc<dyn RequestHandler>,
    codec: Arc<dyn Codec>,
    stats: Arc<ResponderStats>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RpcResponder {
    /// Responder for `routing_key` on `exchange`. An empty exchange means
    /// the default exchange, where the routing key is the queue name.
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        let exchange = exchange.into();
        let routing_key = routing_key.into();
        let queue = if exchange.is_empty() {
            routing_key.clone()
        } else {
            format!("{}.{}", exchange, routing_key)
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            exchange,
            routing_key,
            queue,
            handler,
            codec: Arc::new(JsonCodec),
            stats: Arc::new(ResponderStats::default()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn from_fn<F, Fut>(exchange: impl Into<String>, routing_key: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        Self::new(exchange, routing_key, Arc::new(FnHandler(f)))
    }

    /// Override the work queue name. Ignored on the default exchange.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        if !self.exchange.is_empty() {
            self.queue = queue.into();
        }
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn stats(&self) -> &ResponderStats {
        &self.stats
    }

    /// Stop serving. Requests stay queued for the next responder.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn declare(&self, channel: &Arc<dyn Channel>) -> Result<Consumer, RpcError> {
        let setup = |e: mq_broker::BrokerError| RpcError::Setup(e.to_string());

        if !self.exchange.is_empty() {
            channel
                .declare_exchange(&self.exchange, ExchangeKind::Direct)
                .await
                .map_err(setup)?;
        }
        channel
            .declare_queue(&self.queue, QueueOptions::shared())
            .await
            .map_err(setup)?;
        if !self.exchange.is_empty() {
            channel
                .bind_queue(&self.queue, &self.exchange, &self.routing_key)
                .await
                .map_err(setup)?;
        }
        channel
            .consume(&self.queue, ConsumeOptions::no_ack())
            .await
            .map_err(setup)
    }

    async fn respond(&self, channel: &Arc<dyn Channel>, delivery: Delivery) {
        let (Some(reply_to), Some(correlation_id)) =
            (delivery.reply_to(), delivery.correlation_id())
        else {
            warn!(
                queue = %self.queue,
                delivery_tag = delivery.delivery_tag,
                "Request without reply-to or correlation id dropped"
            );
            self.record(&self.stats.dropped, "dropped");
            return;
        };

        let (reply, ok) = match self.codec.decode(&delivery.body) {
            Ok(request) => match self.handler.handle(request).await {
                Ok(value) => (value, true),
                Err(e) => {
                    debug!(correlation_id, error = %e, "Handler failed");
                    (json!({ "error": e.to_string() }), false)
                }
            },
            Err(e) => {
                warn!(correlation_id, error = %e, "Undecodable request");
                (json!({ "error": format!("invalid request: {}", e) }), false)
            }
        };

        let body = match self.codec.encode(&reply) {
            Ok(body) => body,
            Err(e) => {
                warn!(correlation_id, error = %e, "Failed to encode reply");
                self.record(&self.stats.failed, "error");
                return;
            }
        };
        let properties = MessageProperties::new()
            .with_correlation_id(correlation_id)
            .with_content_type(self.codec.content_type());

        if let Err(e) = channel
            .publish(DEFAULT_EXCHANGE, reply_to, body, properties)
            .await
        {
            warn!(correlation_id, reply_to, error = %e, "Failed to publish reply");
            self.record(&self.stats.failed, "error");
            return;
        }

        if ok {
            self.record(&self.stats.served, "ok");
        } else {
            self.record(&self.stats.failed, "error");
        }
    }

    fn record(&self, counter: &AtomicU64, outcome: &str) {
        counter.fetch_add(1, Ordering::Relaxed);
        RPC_REQUESTS_SERVED
            .with_label_values(&[self.routing_key.as_str(), outcome])
            .inc();
    }
}

#[async_trait]
impl ConnectionListener for RpcResponder {
    async fn on_connected(&self, channel: Arc<dyn Channel>) -> Result<(), RpcError> {
        let consumer = self.declare(&channel).await?;
        info!(
            exchange = %self.exchange,
            routing_key = %self.routing_key,
            queue = %self.queue,
            "Responder bound"
        );
        tokio::spawn(serve(self.clone(), channel, consumer));
        Ok(())
    }

    fn name(&self) -> &str {
        &self.queue
    }
}

/// Serve requests one at a time until the consumer ends or the responder
/// is stopped.
async fn serve(responder: RpcResponder, channel: Arc<dyn Channel>, mut consumer: Consumer) {
    let mut shutdown = responder.shutdown.subscribe();
    if *shutdown.borrow_and_update() {
        return;
    }

    loop {
        let delivery = tokio::select! {
            delivery = consumer.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
            _ = shutdown.changed() => break,
        };
        responder.respond(&channel, delivery).await;
    }
    debug!(queue = %responder.queue, "Responder consumer ended");
}
