//! # Transport Events
//!
//! Advisory events emitted by connections and channels.

use serde::{Deserialize, Serialize};
use std::fmt;

/// AMQP 0-9-1 reply codes used in close reasons.
pub mod reply_codes {
    pub const REPLY_SUCCESS: u16 = 200;
    pub const CONTENT_TOO_LARGE: u16 = 311;
    pub const CONNECTION_FORCED: u16 = 320;
    pub const INVALID_PATH: u16 = 402;
    pub const ACCESS_REFUSED: u16 = 403;
    pub const NOT_FOUND: u16 = 404;
    pub const RESOURCE_LOCKED: u16 = 405;
    pub const PRECONDITION_FAILED: u16 = 406;
    pub const FRAME_ERROR: u16 = 501;
    pub const CHANNEL_ERROR: u16 = 504;
    pub const NOT_ALLOWED: u16 = 530;
    pub const INTERNAL_ERROR: u16 = 541;
}

/// Why a connection or channel was closed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseReason {
    /// Reply code
    pub code: u16,
    /// Human-readable reply text
    pub text: String,
}

impl CloseReason {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Clean, application-initiated close.
    pub fn normal() -> Self {
        Self::new(reply_codes::REPLY_SUCCESS, "OK")
    }

    /// Broker-initiated close (shutdown, operator action).
    pub fn forced(text: impl Into<String>) -> Self {
        Self::new(reply_codes::CONNECTION_FORCED, text)
    }

    #[must_use]
    pub fn is_normal(&self) -> bool {
        self.code == reply_codes::REPLY_SUCCESS
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Event emitted on a connection or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A non-terminal error was reported.
    Error(String),
    /// The connection or channel was closed.
    Closed(CloseReason),
}

impl TransportEvent {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_reason_constructors() {
        assert!(CloseReason::normal().is_normal());
        let forced = CloseReason::forced("broker shutdown");
        assert_eq!(forced.code, reply_codes::CONNECTION_FORCED);
        assert!(!forced.is_normal());
    }

    #[test]
    fn test_close_reason_display() {
        let reason = CloseReason::forced("CONNECTION_FORCED - shutdown");
        assert_eq!(reason.to_string(), "320 CONNECTION_FORCED - shutdown");
    }

    #[test]
    fn test_event_is_closed() {
        assert!(TransportEvent::Closed(CloseReason::normal()).is_closed());
        assert!(!TransportEvent::Error("heartbeat missed".into()).is_closed());
    }
}
