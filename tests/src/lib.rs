//! # MQ-RPC Test Suite
//!
//! Cross-crate scenarios driven through the in-memory broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! └── integration/
//!     ├── fixtures.rs   # Supervisor + client + responder wiring
//!     ├── rpc_flows.rs  # Calls, typed calls, errors, concurrency
//!     ├── reconnect.rs  # Forced closes, dial failures, close policy
//!     └── runtime.rs    # The host runtime in both reply modes
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p mq-tests
//! cargo test -p mq-tests integration::reconnect::
//! ```

pub mod integration;
