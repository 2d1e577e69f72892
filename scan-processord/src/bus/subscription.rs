use tracing::info;
use uuid::Uuid;
use crate::bus::SubscriptionAdmin;
use crate::error::SetupError;

/// A subscription created for this process run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pub name: String,
    pub topic: String,
}

/// Unique subscription name so concurrent consumers and restarts never share one.
pub fn subscription_name(prefix: &str, topic: &str) -> String {
    format!("{}_{}_{}", prefix, topic, Uuid::new_v4())
}

/// Create a fresh subscription on `topic`. Must succeed before ingestion starts.
pub async fn establish<A: SubscriptionAdmin + ?Sized>(
    admin: &A,
    topic: &str,
    prefix: &str,
) -> Result<SubscriptionHandle, SetupError> {
    if topic.trim().is_empty() {
        return Err(SetupError::EmptyTopic);
    }

    let name = subscription_name(prefix, topic);
    admin
        .create_subscription(topic, &name)
        .await
        .map_err(|source| SetupError::CreateSubscription {
            topic: topic.to_string(),
            subscription: name.clone(),
            source,
        })?;

    info!(topic, subscription = %name, "Subscribed to topic");

    Ok(SubscriptionHandle {
        name,
        topic: topic.to_string(),
    })
}
