//! Connection supervisor state machine.
//!
//! ```text
//! Disconnected → Connecting → Connected → Reconnecting → Connecting → ...
//!                                 │
//!                                 └──(close outside the policy)──→ Stopped
//! ```

use std::fmt;
use std::time::Duration;

/// Observable state of the connection supervisor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not started yet
    #[default]
    Disconnected,
    /// Dialing the broker
    Connecting { attempt: u64 },
    /// Channel open and every listener bound
    Connected { generation: u64 },
    /// Waiting out the retry delay
    Reconnecting { attempt: u64, delay: Duration },
    /// Supervisor loop has exited and will not reconnect
    Stopped { code: u16, reason: String },
}

impl ConnectionState {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped { .. })
    }

    /// Connection generation, if connected.
    #[must_use]
    pub fn generation(&self) -> Option<u64> {
        match self {
            Self::Connected { generation } => Some(*generation),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting { attempt } => write!(f, "connecting (attempt {})", attempt),
            Self::Connected { generation } => write!(f, "connected (generation {})", generation),
            Self::Reconnecting { attempt, delay } => write!(
                f,
                "reconnecting (attempt {} in {}ms)",
                attempt,
                delay.as_millis()
            ),
            Self::Stopped { code, reason } => write!(f, "stopped ({} {})", code, reason),
        }
    }
}
