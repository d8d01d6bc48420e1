//! # MQ-RPC Runtime
//!
//! Entry point. Loads configuration from the environment, starts the
//! runtime against the in-memory broker, makes one `add` call and then
//! serves until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mq_broker::InMemoryBroker;
use mq_runtime::{Runtime, RuntimeConfig};
use mq_telemetry::{encode_metrics, init_telemetry};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = RuntimeConfig::from_env().context("Failed to load configuration")?;
    let _telemetry =
        init_telemetry(config.telemetry.clone()).context("Failed to initialize telemetry")?;

    let demo_call = config.demo_call;
    let connect_wait = config.rpc.client.connect_wait;

    let broker = Arc::new(InMemoryBroker::new());
    let runtime = Runtime::start(config, broker).context("Failed to start runtime")?;

    if demo_call {
        run_demo(&runtime, connect_wait).await;
    }

    info!("Serving RPC requests, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    runtime.shutdown().await;
    Ok(())
}

async fn run_demo(runtime: &Runtime, connect_wait: Duration) {
    if let Err(e) = runtime.wait_ready(connect_wait).await {
        error!(error = %e, "Broker not ready, skipping demo call");
        return;
    }

    match runtime.add(2, 3).await {
        Ok(sum) => info!("2 + 3 = {}", sum),
        Err(e) => error!(error = %e, "Demo call failed"),
    }

    match encode_metrics() {
        Ok(text) => debug!(metrics = %text, "Metrics after demo call"),
        Err(e) => debug!(error = %e, "Failed to encode metrics"),
    }
}
