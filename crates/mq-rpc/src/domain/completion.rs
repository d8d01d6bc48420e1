//! Completion sink for a pending call.
//!
//! A completion is consumed by value, so a call can be resolved at most
//! once. The success path runs the success continuation. The failure path
//! signals the result sink and the failure continuation independently.
//!
//! Continuations are caller code running on the reply consumer loop. A
//! panic inside one is contained and logged; it never reaches the loop.

use crate::domain::error::RpcError;
use crate::ports::ResultSink;
use parking_lot::Mutex;
use serde_json::Value;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::error;

type SuccessFn = Box<dyn FnOnce(Value) + Send + 'static>;
type FailureFn = Box<dyn FnOnce(RpcError) + Send + 'static>;

/// Continuations invoked when a call resolves.
pub struct Completion {
    on_success: SuccessFn,
    on_failure: Option<FailureFn>,
    sink: Option<Arc<dyn ResultSink>>,
}

impl Completion {
    /// Completion with only a success continuation.
    pub fn new<F>(on_success: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        Self {
            on_success: Box::new(on_success),
            on_failure: None,
            sink: None,
        }
    }

    pub fn on_failure<F>(mut self, on_failure: F) -> Self
    where
        F: FnOnce(RpcError) + Send + 'static,
    {
        self.on_failure = Some(Box::new(on_failure));
        self
    }

    /// Attach an external sink that is told about server-side failures.
    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Completion that forwards the outcome to a oneshot receiver.
    pub fn channel() -> (Self, oneshot::Receiver<Result<Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let failure_tx = Arc::clone(&tx);

        let completion = Self::new(move |value| {
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send(Ok(value));
            }
        })
        .on_failure(move |error| {
            if let Some(tx) = failure_tx.lock().take() {
                let _ = tx.send(Err(error));
            }
        });

        (completion, rx)
    }

    pub fn has_failure_path(&self) -> bool {
        self.on_failure.is_some() || self.sink.is_some()
    }

    /// Run the success continuation. Returns false if it panicked.
    pub fn succeed(self, value: Value) -> bool {
        let on_success = self.on_success;
        guarded("success", move || on_success(value))
    }

    /// Signal the sink, then run the failure continuation. Returns false
    /// if either panicked; a panicking sink does not skip the continuation.
    pub fn fail(self, error: RpcError) -> bool {
        let mut clean = true;
        if let Some(sink) = &self.sink {
            clean &= guarded("sink", || sink.server_error(&error));
        }
        if let Some(on_failure) = self.on_failure {
            clean &= guarded("failure", move || on_failure(error));
        }
        clean
    }
}

fn guarded(path: &'static str, continuation: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(continuation)) {
        Ok(()) => true,
        Err(_) => {
            error!(path, "Completion continuation panicked");
            false
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("on_failure", &self.on_failure.is_some())
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
