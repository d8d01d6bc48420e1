//! External result sink.

use crate::domain::error::RpcError;

/// Receiver of a generic server-error signal for a failed call.
///
/// Typically wraps an HTTP response so the caller's client sees a 500
/// when a reply cannot be handled.
pub trait ResultSink: Send + Sync {
    fn server_error(&self, error: &RpcError);
}
