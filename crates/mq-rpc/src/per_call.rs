//! RPC with a dedicated reply queue per call.
//!
//! Each call declares its own exclusive queue, consumes it, publishes the
//! request with that queue as reply-to, and deletes the queue shortly after
//! the call resolves. Costs two extra broker round trips per call but
//! needs no shared consumer.

use crate::adapters::JsonCodec;
use crate::domain::config::ClientConfig;
use crate::domain::error::RpcError;
use crate::domain::request::RpcRequest;
use crate::ports::Codec;
use crate::supervisor::SupervisorHandle;
use mq_broker::{Channel, ConsumeOptions, Consumer, Delivery, MessageProperties, QueueOptions};
use mq_telemetry::metrics::record_failure;
use mq_telemetry::{RPC_CALLS_SENT, RPC_REPLIES_MATCHED, RPC_REPLIES_UNMATCHED};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-call reply queue RPC.
#[derive(Clone)]
pub struct PerCallRpc {
    supervisor: SupervisorHandle,
    config: ClientConfig,
    codec: Arc<dyn Codec>,
}

impl PerCallRpc {
    pub fn new(supervisor: SupervisorHandle, config: ClientConfig) -> Self {
        Self {
            supervisor,
            config,
            codec: Arc::new(JsonCodec),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Send a request and wait for the reply on a fresh queue.
    pub async fn call(&self, request: RpcRequest) -> Result<Value, RpcError> {
        let channel = self
            .supervisor
            .wait_connected(self.config.connect_wait)
            .await
            .inspect_err(|e| record_failure(e.reason()))?;

        let body = self
            .codec
            .encode(&request.payload)
            .map_err(|e| RpcError::Serialize(e.to_string()))?;
        let correlation_id = request.correlation_id.unwrap_or_default();
        let timeout = request.timeout.resolve(self.config.default_timeout);

        let reply_queue = format!("{}{}", self.config.reply_queue_prefix, Uuid::new_v4().simple());
        channel
            .declare_queue(&reply_queue, QueueOptions::exclusive_auto_delete())
            .await
            .map_err(|e| RpcError::ReplyQueue(e.to_string()))?;

        let consumer = match channel
            .consume(&reply_queue, ConsumeOptions::no_ack())
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.schedule_delete(&channel, &reply_queue);
                return Err(RpcError::ReplyQueue(e.to_string()));
            }
        };

        let properties = MessageProperties::new()
            .with_correlation_id(correlation_id.as_str())
            .with_reply_to(reply_queue.as_str())
            .with_content_type(self.codec.content_type());

        if let Err(e) = channel
            .publish(&request.exchange, &request.routing_key, body, properties)
            .await
        {
            self.schedule_delete(&channel, &reply_queue);
            warn!(
                correlation_id = %correlation_id,
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
            reply_to = %reply_queue,
            "Sent RPC request on per-call queue"
        );

        let outcome = wait_for_reply(consumer, correlation_id.as_str(), timeout).await;
        self.schedule_delete(&channel, &reply_queue);

        let delivery = outcome.inspect_err(|e| record_failure(e.reason()))?;
        RPC_REPLIES_MATCHED.inc();
        self.codec.decode(&delivery.body).map_err(|e| {
            record_failure("deserialize");
            RpcError::Deserialize(e.to_string())
        })
    }

    /// Delete the reply queue after the grace delay, off the caller's path.
    fn schedule_delete(&self, channel: &Arc<dyn Channel>, queue: &str) {
        let channel = Arc::clone(channel);
        let queue = queue.to_string();
        let grace = self.config.per_call_delete_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match channel.delete_queue(&queue).await {
                Ok(()) => debug!(queue = %queue, "Per-call reply queue deleted"),
                // Gone already if the connection dropped
                Err(e) => debug!(queue = %queue, error = %e, "Per-call reply queue not deleted"),
            }
        });
    }
}

async fn wait_for_reply(
    mut consumer: Consumer,
    correlation_id: &str,
    timeout: Option<Duration>,
) -> Result<Delivery, RpcError> {
    let matching = async {
        while let Some(delivery) = consumer.recv().await {
            if delivery.correlation_id() == Some(correlation_id) {
                return Ok(delivery);
            }
            RPC_REPLIES_UNMATCHED.inc();
            debug!(
                expected = correlation_id,
                got = ?delivery.correlation_id(),
                "Ignoring reply for another call"
            );
        }
        Err(RpcError::Cancelled)
    };

    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, matching)
            .await
            .unwrap_or(Err(RpcError::Timeout(timeout))),
        None => matching.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::SupervisorConfig;
    use crate::domain::correlation::CorrelationId;
    use crate::supervisor::connect;
    use bytes::Bytes;
    use mq_broker::{InMemoryBroker, DEFAULT_EXCHANGE};
    use serde_json::json;

    async fn connected(broker: &InMemoryBroker) -> SupervisorHandle {
        let handle = connect(
            Arc::new(broker.clone()),
            SupervisorConfig::new("memory://test"),
            |_| {},
        );
        handle.wait_connected(Duration::from_secs(5)).await.unwrap();
        handle
    }

    /// Echo worker on the default exchange queue `echo`.
    async fn spawn_echo(broker: &InMemoryBroker, handle: &SupervisorHandle) {
        let channel = handle.channel().unwrap();
        channel.declare_queue("echo", QueueOptions::shared()).await.unwrap();
        let mut requests = channel.consume("echo", ConsumeOptions::no_ack()).await.unwrap();
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let (Some(reply_to), Some(id)) = (request.reply_to(), request.correlation_id())
                else {
                    continue;
                };
                broker
                    .inject(
                        DEFAULT_EXCHANGE,
                        reply_to,
                        request.body.clone(),
                        MessageProperties::new().with_correlation_id(id),
                    )
                    .unwrap();
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_uses_and_deletes_own_queue() {
        let broker = InMemoryBroker::new();
        let handle = connected(&broker).await;
        spawn_echo(&broker, &handle).await;
        let rpc = PerCallRpc::new(handle.clone(), ClientConfig::default());

        let reply = rpc
            .call(RpcRequest::new(DEFAULT_EXCHANGE, "echo", json!({"ping": 1})))
            .await
            .unwrap();
        assert_eq!(reply, json!({"ping": 1}));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let leftovers: Vec<String> = broker
            .queue_names()
            .into_iter()
            .filter(|q| q.starts_with("rpc.reply."))
            .collect();
        assert!(leftovers.is_empty(), "reply queues left: {:?}", leftovers);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_foreign_correlation_id() {
        let broker = InMemoryBroker::new();
        let handle = connected(&broker).await;
        let channel = handle.channel().unwrap();
        channel.declare_queue("slow", QueueOptions::shared()).await.unwrap();
        let mut requests = channel.consume("slow", ConsumeOptions::no_ack()).await.unwrap();

        let worker_broker = broker.clone();
        tokio::spawn(async move {
            let request = requests.recv().await.unwrap();
            let reply_to = request.reply_to().unwrap().to_string();
            let id = request.correlation_id().unwrap().to_string();
            for (cid, body) in [("someone-else", &b"1"[..]), (id.as_str(), &b"2"[..])] {
                worker_broker
                    .inject(
                        DEFAULT_EXCHANGE,
                        &reply_to,
                        Bytes::copy_from_slice(body),
                        MessageProperties::new().with_correlation_id(cid),
                    )
                    .unwrap();
            }
        });

        let rpc = PerCallRpc::new(handle.clone(), ClientConfig::default());
        let reply = rpc
            .call(
                RpcRequest::new(DEFAULT_EXCHANGE, "slow", json!(null))
                    .with_correlation_id(CorrelationId::parse("mine").unwrap()),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!(2));

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_still_deletes_queue() {
        let broker = InMemoryBroker::new();
        let handle = connected(&broker).await;
        let rpc = PerCallRpc::new(handle.clone(), ClientConfig::default());

        let err = rpc
            .call(
                RpcRequest::new(DEFAULT_EXCHANGE, "nobody", json!({}))
                    .with_timeout(Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::Timeout(Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(broker
            .queue_names()
            .iter()
            .all(|q| !q.starts_with("rpc.reply.")));

        handle.shutdown().await;
    }
}
