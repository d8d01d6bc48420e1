//! Adapters implementing the ports.

pub mod fn_listener;
pub mod json_codec;
pub mod status_sink;

pub use fn_listener::FnListener;
pub use json_codec::JsonCodec;
pub use status_sink::StatusSink;
