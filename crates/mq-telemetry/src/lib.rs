//! # MQ Telemetry
//!
//! Structured logging and Prometheus metrics for the RPC core.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use mq_telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(TelemetryConfig::from_env())?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `MQ_SERVICE_NAME` | `mq-rpc` | Service name attached to logs |
//! | `MQ_LOG_LEVEL` / `RUST_LOG` | `info` | Log level filter |
//! | `MQ_JSON_LOGS` | `false` (`true` in containers) | JSON formatted logs |
//! | `MQ_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

mod config;
mod logging;
pub mod metrics;

pub use config::TelemetryConfig;
pub use logging::{init_logging, LoggingGuard};
pub use metrics::{
    encode_metrics, register_metrics, MetricsHandle, BROKER_CONNECT_ATTEMPTS,
    BROKER_CONNECTIONS, RPC_CALLS_SENT, RPC_CALL_DURATION, RPC_CALL_FAILURES,
    RPC_PENDING_CALLS, RPC_REPLIES_MATCHED, RPC_REPLIES_UNMATCHED, RPC_REQUESTS_SERVED,
};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize logging: {0}")]
    LoggingInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let metrics = register_metrics()?;
    let logging = init_logging(&config)?;

    Ok(TelemetryGuard {
        _logging: logging,
        _metrics: metrics,
    })
}

/// Guard that keeps telemetry active.
pub struct TelemetryGuard {
    _logging: LoggingGuard,
    _metrics: MetricsHandle,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
