//! Dependents of the connection supervisor.

use crate::domain::error::RpcError;
use async_trait::async_trait;
use mq_broker::Channel;
use std::sync::Arc;

/// Notified once per successful (re)connection with the new channel.
///
/// Returning an error tears the connection down and schedules a retry.
#[async_trait]
pub trait ConnectionListener: Send + Sync {
    async fn on_connected(&self, channel: Arc<dyn Channel>) -> Result<(), RpcError>;

    /// Name used in logs
    fn name(&self) -> &str {
        "listener"
    }
}
