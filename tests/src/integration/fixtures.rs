//! Shared wiring for the integration tests.

use mq_broker::InMemoryBroker;
use mq_rpc::{
    ConnectionSupervisor, HandlerError, RpcClient, RpcConfig, RpcResponder, SupervisorHandle,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub const EXCHANGE: &str = "rpc";

/// A supervised connection with an `add` responder and a client on it.
pub struct Node {
    pub broker: InMemoryBroker,
    pub supervisor: SupervisorHandle,
    pub client: RpcClient,
    pub responder: RpcResponder,
}

impl Node {
    pub fn start(broker: &InMemoryBroker, config: RpcConfig) -> Self {
        let responder = RpcResponder::from_fn(EXCHANGE, "add", add);
        let mut supervisor =
            ConnectionSupervisor::new(Arc::new(broker.clone()), config.supervisor.clone());
        let client = RpcClient::new(config.client, supervisor.subscribe());
        supervisor
            .add_listener(Arc::new(responder.clone()))
            .add_listener(Arc::new(client.clone()));
        client.spawn_sweeper();

        Self {
            broker: broker.clone(),
            supervisor: supervisor.spawn(),
            client,
            responder,
        }
    }

    pub async fn started(config: RpcConfig) -> Self {
        let node = Self::start(&InMemoryBroker::new(), config);
        node.supervisor
            .wait_connected(Duration::from_secs(5))
            .await
            .unwrap();
        node
    }

    pub async fn shutdown(&self) {
        self.responder.stop();
        self.client.shutdown();
        self.supervisor.shutdown().await;
    }
}

/// Config for tests: memory url, one second retry delay.
pub fn config() -> RpcConfig {
    let mut config = RpcConfig::default();
    config.supervisor.url = "memory://integration".into();
    config.supervisor.retry_delay = Duration::from_secs(1);
    config
}

pub async fn add(params: Value) -> Result<Value, HandlerError> {
    let a = params["a"].as_i64().ok_or("missing a")?;
    let b = params["b"].as_i64().ok_or("missing b")?;
    Ok(json!({ "result": a + b }))
}
