//! Result sink that records an HTTP-style status.

use crate::domain::error::RpcError;
use crate::ports::ResultSink;
use parking_lot::Mutex;

/// Status reported for server-side failures.
pub const SERVER_ERROR_STATUS: u16 = 500;

/// Records the status and message of the last server error.
#[derive(Debug, Default)]
pub struct StatusSink {
    last: Mutex<Option<(u16, String)>>,
}

impl StatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<u16> {
        self.last.lock().as_ref().map(|(status, _)| *status)
    }

    pub fn message(&self) -> Option<String> {
        self.last.lock().as_ref().map(|(_, message)| message.clone())
    }
}

impl ResultSink for StatusSink {
    fn server_error(&self, error: &RpcError) {
        *self.last.lock() = Some((SERVER_ERROR_STATUS, error.to_string()));
    }
}
