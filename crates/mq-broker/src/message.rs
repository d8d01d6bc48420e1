//! Message, queue and consumer option types.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Properties carried alongside a message body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Correlation id linking a reply to its request
    pub correlation_id: Option<String>,
    /// Queue the receiver should reply to
    pub reply_to: Option<String>,
    /// MIME type of the body
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    #[must_use]
    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-wide delivery sequence number
    pub delivery_tag: u64,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key used at publish time
    pub routing_key: String,
    /// Opaque body
    pub body: Bytes,
    /// Message properties
    pub properties: MessageProperties,
}

impl Delivery {
    pub fn correlation_id(&self) -> Option<&str> {
        self.properties.correlation_id.as_deref()
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.properties.reply_to.as_deref()
    }
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Only the declaring connection may use the queue; deleted with it
    pub exclusive: bool,
    /// Deleted when its last consumer goes away
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Private reply queue: exclusive and auto-deleting.
    pub fn exclusive_auto_delete() -> Self {
        Self {
            exclusive: true,
            auto_delete: true,
        }
    }

    /// Queue shared by competing consumers (work queue).
    pub fn shared() -> Self {
        Self::default()
    }
}

/// Consumer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker does not wait for acknowledgements
    pub no_ack: bool,
}

impl ConsumeOptions {
    pub fn no_ack() -> Self {
        Self { no_ack: true }
    }
}

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Route to queues bound with exactly the routing key
    Direct,
    /// Route to every bound queue
    Fanout,
}
