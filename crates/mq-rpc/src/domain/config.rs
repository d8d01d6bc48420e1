//! RPC configuration with validation.
//!
//! Durations are written in humantime form (`"5s"`, `"100ms"`) when loaded
//! from a file. `from_env` overlays `MQ_*` variables on the defaults.

use mq_broker::{reply_codes, CloseReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default broker address.
pub const DEFAULT_BROKER_URL: &str = "amqp://localhost";

/// Queue names with this prefix are reserved by the broker.
const RESERVED_QUEUE_PREFIX: &str = "amq.";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Connection supervisor settings
    pub supervisor: SupervisorConfig,
    /// Correlation engine settings
    pub client: ClientConfig,
}

impl RpcConfig {
    /// Defaults overlaid with environment variables.
    ///
    /// - `MQ_BROKER_URL`: broker address
    /// - `MQ_RETRY_DELAY_MS`: fixed reconnect delay
    /// - `MQ_RETRY_CLOSE_CODES`: `all` or a comma list of close codes
    /// - `MQ_REPLY_QUEUE_PREFIX`: reply queue name prefix
    /// - `MQ_CALL_TIMEOUT_MS`: default per-call timeout, `0` disables it
    /// - `MQ_SWEEP_INTERVAL_MS`: timeout sweep period
    /// - `MQ_CONNECT_WAIT_MS`: how long `send` waits for a connection
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = env::var("MQ_BROKER_URL") {
            config.supervisor.url = url;
        }
        if let Some(delay) = env_millis("MQ_RETRY_DELAY_MS")? {
            config.supervisor.retry_delay = delay;
        }
        if let Ok(codes) = env::var("MQ_RETRY_CLOSE_CODES") {
            config.supervisor.close_policy = codes.parse()?;
        }
        if let Ok(prefix) = env::var("MQ_REPLY_QUEUE_PREFIX") {
            config.client.reply_queue_prefix = prefix;
        }
        if let Some(timeout) = env_millis("MQ_CALL_TIMEOUT_MS")? {
            config.client.default_timeout = (!timeout.is_zero()).then_some(timeout);
        }
        if let Some(interval) = env_millis("MQ_SWEEP_INTERVAL_MS")? {
            config.client.sweep_interval = interval;
        }
        if let Some(wait) = env_millis("MQ_CONNECT_WAIT_MS")? {
            config.client.connect_wait = wait;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    /// Validate configuration.
    ///
    /// A non-zero connect wait must outlast the retry delay, otherwise a
    /// `send` issued just after a disconnect gives up before the next dial.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.supervisor.validate()?;
        self.client.validate()?;

        let wait = self.client.connect_wait;
        if !wait.is_zero() && wait <= self.supervisor.retry_delay {
            return Err(ConfigError::InvalidDuration(format!(
                "connect_wait ({:?}) must exceed retry_delay ({:?})",
                wait, self.supervisor.retry_delay
            )));
        }
        Ok(())
    }
}

/// Connection supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Broker address handed to `Broker::dial`
    pub url: String,
    /// Fixed delay between connect attempts
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Which connection close codes trigger a reconnect
    pub close_policy: ClosePolicy,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            retry_delay: Duration::from_secs(5),
            close_policy: ClosePolicy::default(),
        }
    }
}

impl SupervisorConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::InvalidUrl("broker url cannot be empty".into()));
        }
        if self.retry_delay.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "retry_delay cannot be 0".into(),
            ));
        }
        if let ClosePolicy::Codes(codes) = &self.close_policy {
            if codes.is_empty() {
                return Err(ConfigError::InvalidClosePolicy(
                    "at least one retryable close code is required".into(),
                ));
            }
        }
        Ok(())
    }
}

/// Correlation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Prefix for generated reply queue names
    pub reply_queue_prefix: String,
    /// Deadline applied to calls that do not set their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Option<Duration>,
    /// How often expired calls are evicted
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// How long `send` waits for a live channel (zero fails immediately)
    #[serde(with = "humantime_serde")]
    pub connect_wait: Duration,
    /// Delay before a per-call reply queue is deleted
    #[serde(with = "humantime_serde")]
    pub per_call_delete_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reply_queue_prefix: "rpc.reply.".to_string(),
            default_timeout: Some(Duration::from_secs(30)),
            sweep_interval: Duration::from_secs(1),
            connect_wait: Duration::from_secs(10),
            per_call_delete_grace: Duration::from_millis(100),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reply_queue_prefix.is_empty() {
            return Err(ConfigError::InvalidQueuePrefix(
                "reply_queue_prefix cannot be empty".into(),
            ));
        }
        if self.reply_queue_prefix.starts_with(RESERVED_QUEUE_PREFIX) {
            return Err(ConfigError::InvalidQueuePrefix(format!(
                "'{}' is reserved by the broker",
                RESERVED_QUEUE_PREFIX
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::InvalidDuration(
                "sweep_interval cannot be 0".into(),
            ));
        }
        if self.default_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::InvalidDuration(
                "default_timeout cannot be 0 (use none to disable)".into(),
            ));
        }
        Ok(())
    }
}

/// Which connection close codes are treated as recoverable.
///
/// Closes outside the policy stop the supervisor for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosePolicy {
    /// Reconnect after every close
    Always,
    /// Reconnect only after closes with one of these reply codes
    Codes(BTreeSet<u16>),
}

impl Default for ClosePolicy {
    fn default() -> Self {
        Self::Codes(BTreeSet::from([reply_codes::CONNECTION_FORCED]))
    }
}

impl ClosePolicy {
    pub fn is_retryable(&self, reason: &CloseReason) -> bool {
        match self {
            Self::Always => true,
            Self::Codes(codes) => codes.contains(&reason.code),
        }
    }
}

impl std::str::FromStr for ClosePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") || s.eq_ignore_ascii_case("always") {
            return Ok(Self::Always);
        }
        let codes = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u16>().map_err(|_| {
                    ConfigError::InvalidClosePolicy(format!("'{}' is not a close code", part))
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        if codes.is_empty() {
            return Err(ConfigError::InvalidClosePolicy("no close codes given".into()));
        }
        Ok(Self::Codes(codes))
    }
}

impl fmt::Display for ClosePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => write!(f, "all"),
            Self::Codes(codes) => {
                let list: Vec<String> = codes.iter().map(u16::to_string).collect();
                write!(f, "{}", list.join(","))
            }
        }
    }
}

fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|ms| Some(Duration::from_millis(ms)))
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Configuration validation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid broker url: {0}")]
    InvalidUrl(String),
    #[error("invalid duration: {0}")]
    InvalidDuration(String),
    #[error("invalid close policy: {0}")]
    InvalidClosePolicy(String),
    #[error("invalid reply queue prefix: {0}")]
    InvalidQueuePrefix(String),
    #[error("invalid value for {key}: '{value}'")]
    InvalidEnv { key: String, value: String },
}
