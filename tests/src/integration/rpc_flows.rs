//! # RPC Flows
//!
//! Client → broker → responder → broker → client, over one supervised
//! connection.
//!
//! ## Flows Tested:
//!
//! 1. **Request/reply**: the reply reaches the caller with its correlation id
//! 2. **Concurrency**: many calls in flight complete with their own results
//! 3. **Failures**: handler errors, unroutable requests, unknown exchanges

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use mq_broker::BrokerError;
    use mq_rpc::{Completion, RpcError, RpcRequest};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use tokio::sync::oneshot;

    use crate::integration::fixtures::{config, Node, EXCHANGE};

    #[derive(Serialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Sum {
        result: i64,
    }

    // =========================================================================
    // REQUEST / REPLY
    // =========================================================================

    #[tokio::test]
    async fn test_add_round_trip() {
        let node = Node::started(config()).await;

        let reply = node
            .client
            .call(RpcRequest::new(EXCHANGE, "add", json!({"a": 2, "b": 3})))
            .await
            .unwrap();

        assert_eq!(reply, json!({"result": 5}));
        assert_eq!(node.client.pending_count(), 0);
        let stats = node.client.stats();
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.completed, 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_typed_call() {
        let node = Node::started(config()).await;

        let sum: Sum = node
            .client
            .call_typed(EXCHANGE, "add", &Add { a: 20, b: 22 })
            .await
            .unwrap();
        assert_eq!(sum, Sum { result: 42 });

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_runs_success_callback_once() {
        let node = Node::started(config()).await;
        let (tx, rx) = oneshot::channel();

        let correlation_id = node
            .client
            .send(
                RpcRequest::new(EXCHANGE, "add", json!({"a": 1, "b": 1})),
                Completion::new(move |value| {
                    let _ = tx.send(value);
                })
                .on_failure(|e| panic!("unexpected failure: {}", e)),
            )
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), json!({"result": 2}));
        assert!(!node.client.is_pending(&correlation_id));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_error_is_a_reply() {
        let node = Node::started(config()).await;

        let reply = node
            .client
            .call(RpcRequest::new(EXCHANGE, "add", json!({"a": 1})))
            .await
            .unwrap();
        assert_eq!(reply, json!({"error": "missing b"}));

        node.shutdown().await;
    }

    // =========================================================================
    // CONCURRENCY
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_match_their_replies() {
        let node = Node::started(config()).await;

        let calls = (0..50i64).map(|i| {
            let client = node.client.clone();
            async move {
                let reply = client
                    .call(RpcRequest::new(EXCHANGE, "add", json!({"a": i, "b": 1000})))
                    .await
                    .unwrap();
                (i, reply)
            }
        });

        for (i, reply) in join_all(calls).await {
            assert_eq!(reply, json!({"result": i + 1000}));
        }
        assert_eq!(node.client.pending_count(), 0);
        assert_eq!(node.client.stats().completed, 50);

        node.shutdown().await;
    }

    // =========================================================================
    // FAILURES
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_request_times_out() {
        let node = Node::started(config()).await;

        let err = node
            .client
            .call(
                RpcRequest::new(EXCHANGE, "nobody", json!({}))
                    .with_timeout(Duration::from_secs(3)),
            )
            .await
            .unwrap_err();

        assert_eq!(err, RpcError::Timeout(Duration::from_secs(3)));
        assert_eq!(node.client.stats().timeouts, 1);
        assert_eq!(node.client.pending_count(), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_exchange_fails_publish() {
        let node = Node::started(config()).await;

        let err = node
            .client
            .call(RpcRequest::new("missing", "add", json!({"a": 1, "b": 2})))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            RpcError::Publish(BrokerError::ExchangeNotFound("missing".into()))
        );
        assert_eq!(node.client.pending_count(), 0);
        assert_eq!(node.client.stats().cancelled, 1);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_calls() {
        let node = Node::started(config()).await;
        let client = node.client.clone();

        let pending = tokio::spawn(async move {
            client
                .call(RpcRequest::new(EXCHANGE, "nobody", json!({})).without_timeout())
                .await
        });
        while node.client.pending_count() == 0 {
            tokio::task::yield_now().await;
        }

        node.shutdown().await;
        assert_eq!(pending.await.unwrap(), Err(RpcError::Shutdown));
    }
}
