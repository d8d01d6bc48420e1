//! # Runtime Configuration
//!
//! Everything the host binary needs, loaded from `MQ_*` environment
//! variables on top of the library defaults.

use mq_rpc::{ConfigError, ReplyMode, RpcConfig};
use mq_telemetry::TelemetryConfig;
use std::env;

/// Complete runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Supervisor and correlation engine settings.
    pub rpc: RpcConfig,
    /// Which reply queue strategy outgoing calls use.
    pub reply_mode: ReplyMode,
    /// Logging settings.
    pub telemetry: TelemetryConfig,
    /// Run one `add` call after startup.
    pub demo_call: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            reply_mode: ReplyMode::default(),
            telemetry: TelemetryConfig::for_service("mq-runtime"),
            demo_call: true,
        }
    }
}

impl RuntimeConfig {
    /// Load from the environment.
    ///
    /// Besides the variables read by [`RpcConfig::from_env`] and
    /// [`TelemetryConfig::from_env`]:
    ///
    /// - `MQ_REPLY_MODE`: `shared` (default) or `per-call`
    /// - `MQ_DEMO_CALL`: `false` skips the startup `add` call
    pub fn from_env() -> Result<Self, ConfigError> {
        let reply_mode = match env::var("MQ_REPLY_MODE") {
            Ok(mode) => mode.parse()?,
            Err(_) => ReplyMode::default(),
        };

        let demo_call = match env::var("MQ_DEMO_CALL") {
            Ok(value) => parse_bool("MQ_DEMO_CALL", &value)?,
            Err(_) => true,
        };

        Ok(Self {
            rpc: RpcConfig::from_env()?,
            reply_mode,
            telemetry: TelemetryConfig::for_service("mq-runtime"),
            demo_call,
        })
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}
