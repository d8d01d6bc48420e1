//! End-to-end flows through the in-memory broker.

#[cfg(test)]
mod fixtures;
mod reconnect;
mod rpc_flows;
mod runtime;
