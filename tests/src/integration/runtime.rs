//! # Host Runtime
//!
//! The runtime wired the way the binary runs it, in both reply modes.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use mq_broker::{CloseReason, InMemoryBroker};
    use mq_rpc::ReplyMode;
    use mq_runtime::{Runtime, RuntimeConfig, RuntimeError};

    fn runtime_config(reply_mode: ReplyMode) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.rpc.supervisor.url = "memory://runtime".into();
        config.rpc.supervisor.retry_delay = Duration::from_millis(500);
        config.reply_mode = reply_mode;
        config
    }

    async fn started(broker: &InMemoryBroker, reply_mode: ReplyMode) -> Runtime {
        let runtime =
            Runtime::start(runtime_config(reply_mode), Arc::new(broker.clone())).unwrap();
        runtime.wait_ready(Duration::from_secs(5)).await.unwrap();
        runtime
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_modes_add() {
        for mode in [ReplyMode::Shared, ReplyMode::PerCall] {
            let broker = InMemoryBroker::new();
            let runtime = started(&broker, mode).await;

            assert_eq!(runtime.add(2, 3).await.unwrap(), 5);
            assert_eq!(runtime.reply_mode(), mode);

            runtime.shutdown().await;
            assert_eq!(broker.open_connections(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_call_mode_survives_reconnect() {
        let broker = InMemoryBroker::new();
        let runtime = started(&broker, ReplyMode::PerCall).await;
        assert_eq!(runtime.add(1, 2).await.unwrap(), 3);

        broker.force_close_connections(CloseReason::forced("broker restart"));
        let mut state = runtime.supervisor().subscribe();
        state.wait_for(|s| s.generation() == Some(2)).await.unwrap();

        assert_eq!(runtime.add(3, 4).await.unwrap(), 7);

        // Per-call queues are gone once their grace delay passes
        tokio::time::sleep(Duration::from_secs(1)).await;
        let leftover = broker
            .queue_names()
            .into_iter()
            .filter(|q| q.starts_with("rpc.reply."))
            .filter(|q| Some(q.as_str()) != runtime.client().reply_queue().as_deref())
            .count();
        assert_eq!(leftover, 0);

        runtime.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_error_is_reported() {
        let broker = InMemoryBroker::new();
        let runtime = started(&broker, ReplyMode::PerCall).await;

        let err = runtime.add(i64::MIN, -1).await.unwrap_err();
        assert!(matches!(err, RuntimeError::Remote(ref m) if m == "integer overflow"));

        runtime.shutdown().await;
    }
}
