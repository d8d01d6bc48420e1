//! Domain types for the RPC core.
//!
//! Correlation, pending calls, configuration and the supervisor state
//! machine. Nothing here talks to the broker.

pub mod completion;
pub mod config;
pub mod correlation;
pub mod error;
pub mod pending;
pub mod request;
pub mod state;

// Re-exports for convenience
pub use completion::Completion;
pub use config::{ClientConfig, ClosePolicy, ConfigError, RpcConfig, SupervisorConfig};
pub use correlation::CorrelationId;
pub use error::RpcError;
pub use pending::{PendingCall, PendingCallTable, PendingStats, PendingStatsSnapshot};
pub use request::{CallTimeout, RpcRequest};
pub use state::ConnectionState;
