//! Closure-backed connection listener.

use crate::domain::error::RpcError;
use crate::ports::ConnectionListener;
use async_trait::async_trait;
use mq_broker::Channel;
use std::sync::Arc;

/// Runs a plain callback with each new channel.
pub struct FnListener<F> {
    name: String,
    callback: F,
}

impl<F> FnListener<F>
where
    F: Fn(Arc<dyn Channel>) + Send + Sync,
{
    pub fn new(name: impl Into<String>, callback: F) -> Self {
        Self {
            name: name.into(),
            callback,
        }
    }
}

#[async_trait]
impl<F> ConnectionListener for FnListener<F>
where
    F: Fn(Arc<dyn Channel>) + Send + Sync,
{
    async fn on_connected(&self, channel: Arc<dyn Channel>) -> Result<(), RpcError> {
        (self.callback)(channel);
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
