//! # MQ Runtime Library
//!
//! Wires the RPC core into a running process: one supervised connection,
//! the `add` responder and a client that calls it. The binary in `main.rs`
//! is a thin shell around [`Runtime`]; tests drive it directly.
//!
//! ## Startup Sequence
//!
//! 1. Validate configuration
//! 2. Register the responder, then the client, as connection listeners
//! 3. Start the timeout sweep and the supervisor
//! 4. Calls wait for the first connection on their own

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod handlers;

pub use config::RuntimeConfig;

use crate::handlers::{add_responder, AddRequest, AddResponse, ADD_ROUTING_KEY, RPC_EXCHANGE};
use mq_broker::Broker;
use mq_rpc::{
    ConfigError, ConnectionState, ConnectionSupervisor, PerCallRpc, ReplyMode, RpcClient,
    RpcError, RpcRequest, RpcResponder, SupervisorHandle,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Errors surfaced by the runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The responder answered with `{"error": ...}`
    #[error("Remote error: {0}")]
    Remote(String),
}

/// The running process.
pub struct Runtime {
    reply_mode: ReplyMode,
    supervisor: SupervisorHandle,
    client: RpcClient,
    per_call: PerCallRpc,
    responder: RpcResponder,
}

impl Runtime {
    /// Start everything against `broker`. Must be called inside a Tokio
    /// runtime.
    pub fn start(config: RuntimeConfig, broker: Arc<dyn Broker>) -> Result<Self, RuntimeError> {
        config.rpc.validate()?;

        info!("===========================================");
        info!("  MQ-RPC Runtime v{}", env!("CARGO_PKG_VERSION"));
        info!("  Broker: {}", config.rpc.supervisor.url);
        info!("  Reply mode: {:?}", config.reply_mode);
        info!(
            "  Reconnect: every {:?} on close codes {}",
            config.rpc.supervisor.retry_delay, config.rpc.supervisor.close_policy
        );
        info!("===========================================");

        let responder = add_responder();
        let mut supervisor = ConnectionSupervisor::new(broker, config.rpc.supervisor.clone());
        let client = RpcClient::new(config.rpc.client.clone(), supervisor.subscribe());

        // Responder first so the work queue exists before the client is
        // reported ready.
        supervisor
            .add_listener(Arc::new(responder.clone()))
            .add_listener(Arc::new(client.clone()));
        client.spawn_sweeper();

        let supervisor = supervisor.spawn();
        let per_call = PerCallRpc::new(supervisor.clone(), config.rpc.client);

        Ok(Self {
            reply_mode: config.reply_mode,
            supervisor,
            client,
            per_call,
            responder,
        })
    }

    /// Wait until the first connection is up and every listener is bound.
    pub async fn wait_ready(&self, wait: Duration) -> Result<(), RuntimeError> {
        self.supervisor.wait_connected(wait).await?;
        Ok(())
    }

    /// Call the `add` procedure using the configured reply mode.
    pub async fn add(&self, a: i64, b: i64) -> Result<i64, RuntimeError> {
        let payload = serde_json::to_value(AddRequest { a, b })
            .map_err(|e| RpcError::Serialize(e.to_string()))?;
        let request = RpcRequest::new(RPC_EXCHANGE, ADD_ROUTING_KEY, payload);

        let reply = match self.reply_mode {
            ReplyMode::Shared => self.client.call(request).await?,
            ReplyMode::PerCall => self.per_call.call(request).await?,
        };

        let response: AddResponse = parse_reply(reply)?;
        Ok(response.result)
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.reply_mode
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    pub fn supervisor(&self) -> &SupervisorHandle {
        &self.supervisor
    }

    pub fn responder(&self) -> &RpcResponder {
        &self.responder
    }

    /// Graceful shutdown.
    ///
    /// 1. Stop serving requests
    /// 2. Fail pending calls with `RpcError::Shutdown`
    /// 3. Close the connection and stop the supervisor
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown...");
        self.responder.stop();
        self.client.shutdown();
        self.supervisor.shutdown().await;
        info!("Shutdown complete");
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(reply: Value) -> Result<T, RuntimeError> {
    if let Some(message) = reply.get("error").and_then(Value::as_str) {
        return Err(RuntimeError::Remote(message.to_string()));
    }
    serde_json::from_value(reply).map_err(|e| RpcError::Deserialize(e.to_string()).into())
}
