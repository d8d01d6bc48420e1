//! # Reconnect Scenarios
//!
//! The broker drops the connection while calls are flowing. The supervisor
//! reconnects after the fixed delay, listeners rebind, and new calls go
//! through a fresh reply queue.

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use futures::future::join_all;
    use mq_broker::{reply_codes, CloseReason, InMemoryBroker};
    use mq_rpc::{ClosePolicy, ConnectionState, RpcError, RpcRequest};
    use serde_json::json;
    use tokio::time::Instant;

    use crate::integration::fixtures::{config, Node, EXCHANGE};

    async fn wait_for_generation(node: &Node, generation: u64) {
        let mut state = node.supervisor.subscribe();
        state
            .wait_for(|s| s.generation() == Some(generation))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_close_reconnects_and_rebinds() {
        let node = Node::started(config()).await;
        let first_queue = node.client.reply_queue().unwrap();

        // In flight when the connection drops; nobody will answer it.
        let client = node.client.clone();
        let stranded = tokio::spawn(async move {
            client
                .call(
                    RpcRequest::new(EXCHANGE, "nobody", json!({}))
                        .with_timeout(Duration::from_secs(10)),
                )
                .await
        });
        while node.client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        let dropped_at = Instant::now();
        assert_eq!(
            node.broker
                .force_close_connections(CloseReason::forced("broker restart")),
            1
        );
        wait_for_generation(&node, 2).await;
        assert!(dropped_at.elapsed() >= Duration::from_secs(1));

        let second_queue = node.client.reply_queue().unwrap();
        assert_ne!(first_queue, second_queue);
        assert!(!node.broker.queue_exists(&first_queue));
        assert_eq!(node.broker.consumer_count(&second_queue), 1);
        assert_eq!(node.broker.consumer_count("rpc.add"), 1);
        assert_eq!(node.broker.dial_count(), 2);

        let reply = node
            .client
            .call(RpcRequest::new(EXCHANGE, "add", json!({"a": 2, "b": 3})))
            .await
            .unwrap();
        assert_eq!(reply, json!({"result": 5}));

        assert_eq!(
            stranded.await.unwrap(),
            Err(RpcError::Timeout(Duration::from_secs(10)))
        );

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_during_reconnect_wait_for_connection() {
        let node = Node::started(config()).await;

        node.broker
            .force_close_connections(CloseReason::forced("broker restart"));
        let mut state = node.supervisor.subscribe();
        state.wait_for(|s| !s.is_connected()).await.unwrap();

        let calls = (0..10i64).map(|i| {
            let client = node.client.clone();
            async move {
                client
                    .call(RpcRequest::new(EXCHANGE, "add", json!({"a": i, "b": i})))
                    .await
            }
        });

        for (i, reply) in join_all(calls).await.into_iter().enumerate() {
            assert_eq!(reply.unwrap(), json!({"result": 2 * i as i64}));
        }
        assert_eq!(node.supervisor.state().generation(), Some(2));

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_close_stops() {
        let node = Node::started(config()).await;

        node.broker.force_close_connections(CloseReason::new(
            reply_codes::INTERNAL_ERROR,
            "internal error",
        ));
        let mut state = node.supervisor.subscribe();
        state.wait_for(|s| s.is_stopped()).await.unwrap();

        assert_eq!(
            node.supervisor.state(),
            ConnectionState::Stopped {
                code: reply_codes::INTERNAL_ERROR,
                reason: "internal error".into()
            }
        );

        let started = Instant::now();
        let err = node
            .client
            .call(RpcRequest::new(EXCHANGE, "add", json!({"a": 1, "b": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NotConnected { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(node.broker.dial_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_any_close_code() {
        let mut config = config();
        config.supervisor.close_policy = ClosePolicy::Always;
        let node = Node::started(config).await;

        node.broker.force_close_connections(CloseReason::new(
            reply_codes::INTERNAL_ERROR,
            "internal error",
        ));
        wait_for_generation(&node, 2).await;

        let reply = node
            .client
            .call(RpcRequest::new(EXCHANGE, "add", json!({"a": 4, "b": 4})))
            .await
            .unwrap();
        assert_eq!(reply, json!({"result": 8}));

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_failures_are_retried() {
        let broker = InMemoryBroker::new();
        broker.fail_next_dials(3);
        let node = Node::start(&broker, config());

        let started = Instant::now();
        node.supervisor
            .wait_connected(Duration::from_secs(60))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(3));
        let stats = node.supervisor.stats();
        assert_eq!(stats.connect_attempts.load(Ordering::Relaxed), 4);
        assert_eq!(stats.connect_failures.load(Ordering::Relaxed), 3);
        assert_eq!(stats.connections.load(Ordering::Relaxed), 1);

        node.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_close_reconnects() {
        let node = Node::started(config()).await;

        node.broker
            .force_close_channels(CloseReason::new(reply_codes::PRECONDITION_FAILED, "bad ack"));
        wait_for_generation(&node, 2).await;

        assert_eq!(node.broker.open_connections(), 1);
        let reply = node
            .client
            .call(RpcRequest::new(EXCHANGE, "add", json!({"a": 0, "b": 9})))
            .await
            .unwrap();
        assert_eq!(reply, json!({"result": 9}));

        node.shutdown().await;
    }
}
