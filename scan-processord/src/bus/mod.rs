//! Message bus abstraction and its Pub/Sub implementation.

pub mod pubsub;
pub mod subscription;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crate::error::BusError;

pub use pubsub::PubSubClient;
pub use subscription::establish;

/// A message delivered from a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Delivery-specific handle used to acknowledge this copy of the message.
    pub ack_id: String,
    /// Provider message identifier, stable across redeliveries.
    pub message_id: String,
    /// Decoded message body.
    pub data: Vec<u8>,
    pub publish_time: Option<DateTime<Utc>>,
    /// Set by the provider when delivery attempts are tracked.
    pub delivery_attempt: Option<u32>,
}

/// Creates and removes subscriptions. Used at startup and shutdown only.
#[async_trait]
pub trait SubscriptionAdmin: Send + Sync {
    /// Create `subscription` bound to `topic`.
    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<(), BusError>;

    /// Delete `subscription`. Unacknowledged messages on it are discarded.
    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError>;
}

/// Pulls and acknowledges messages on one subscription.
///
/// Messages that are never acknowledged are redelivered by the bus once their
/// ack deadline expires.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Pull up to `max_messages`. Returns an empty vec if none are available.
    async fn pull(&self, max_messages: u32) -> Result<Vec<BusMessage>, BusError>;

    /// Acknowledge successful processing so the message is not redelivered.
    async fn ack(&self, ack_id: &str) -> Result<(), BusError>;
}
