//! Ports: the seams between the RPC core and its collaborators.
//!
//! The broker itself is reached through the `mq_broker` traits; the ports
//! here cover body encoding, the HTTP-side result sink, and dependents of
//! the connection supervisor.

pub mod codec;
pub mod listener;
pub mod sink;

pub use codec::{Codec, CodecError};
pub use listener::ConnectionListener;
pub use sink::ResultSink;
