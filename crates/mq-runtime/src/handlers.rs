//! Procedures served by the runtime.

use mq_rpc::{HandlerError, RpcResponder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Exchange the runtime's procedures are bound to.
pub const RPC_EXCHANGE: &str = "rpc";

/// Routing key of the `add` procedure.
pub const ADD_ROUTING_KEY: &str = "add";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AddRequest {
    pub a: i64,
    pub b: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddResponse {
    pub result: i64,
}

/// `{a, b}` to `{result: a + b}`.
pub async fn add(params: Value) -> Result<Value, HandlerError> {
    let AddRequest { a, b } = serde_json::from_value(params)
        .map_err(|e| HandlerError(format!("invalid add request: {}", e)))?;
    let result = a
        .checked_add(b)
        .ok_or_else(|| HandlerError::from("integer overflow"))?;

    serde_json::to_value(AddResponse { result }).map_err(|e| HandlerError(e.to_string()))
}

/// Responder serving [`add`] on `rpc`/`add`.
pub fn add_responder() -> RpcResponder {
    RpcResponder::from_fn(RPC_EXCHANGE, ADD_ROUTING_KEY, add)
}
