//! Google Cloud Pub/Sub over its REST API.
//!
//! Works against the real service (with a bearer token) and against the
//! local emulator (plain HTTP, no auth) when `emulator_host` is set.

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bus::{BusMessage, MessageSource, SubscriptionAdmin};
use crate::config::PubSubConfig;
use crate::error::BusError;

/// REST client scoped to one project.
#[derive(Clone)]
pub struct PubSubClient {
    http: Client,
    base_url: String,
    project: String,
    access_token: Option<String>,
    ack_deadline_secs: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSubscriptionRequest<'a> {
    topic: &'a str,
    ack_deadline_seconds: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: [&'a str; 1],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: PubsubMessage,
    #[serde(default)]
    delivery_attempt: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PubsubMessage {
    #[serde(default)]
    data: String,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

impl PubSubClient {
    pub fn new(config: &PubSubConfig) -> Result<Self, BusError> {
        let base_url = match &config.emulator_host {
            Some(host) => format!("http://{}", host.trim_end_matches('/')),
            None => config.endpoint.trim_end_matches('/').to_string(),
        };

        let http = Client::builder().build()?;

        info!(
            base_url = %base_url,
            project = %config.project,
            emulator = config.emulator_host.is_some(),
            "Pub/Sub client initialized"
        );

        Ok(Self {
            http,
            base_url,
            project: config.project.clone(),
            // Credentials are never sent to the emulator
            access_token: config
                .access_token
                .clone()
                .filter(|_| config.emulator_host.is_none()),
            ack_deadline_secs: config.ack_deadline_secs,
        })
    }

    /// Build a subscriber for an existing subscription.
    pub fn subscriber(&self, subscription: impl Into<String>) -> PubSubSubscriber {
        PubSubSubscriber {
            client: self.clone(),
            subscription: subscription.into(),
        }
    }

    fn topic_path(&self, topic: &str) -> String {
        format!("projects/{}/topics/{}", self.project, topic)
    }

    fn subscription_url(&self, subscription: &str) -> String {
        format!(
            "{}/v1/projects/{}/subscriptions/{}",
            self.base_url, self.project, subscription
        )
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.access_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BusError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(BusError::Status {
            status: status.as_u16(),
            body,
        })
    }

    async fn pull(&self, subscription: &str, max_messages: u32) -> Result<Vec<BusMessage>, BusError> {
        debug!(subscription, max_messages, "Pulling Pub/Sub messages");

        let url = format!("{}:pull", self.subscription_url(subscription));
        let response = self
            .send(self.http.post(url).json(&PullRequest { max_messages }))
            .await?;
        let body: PullResponse = response
            .json()
            .await
            .map_err(|e| BusError::Decode(format!("pull response: {}", e)))?;

        debug!(count = body.received_messages.len(), "Received Pub/Sub messages");
        Ok(decode_received(body.received_messages))
    }

    async fn acknowledge(&self, subscription: &str, ack_id: &str) -> Result<(), BusError> {
        let url = format!("{}:acknowledge", self.subscription_url(subscription));
        self.send(self.http.post(url).json(&AcknowledgeRequest { ack_ids: [ack_id] }))
            .await?;
        Ok(())
    }
}

/// Convert received messages, dropping any whose body is not valid base64.
/// Dropped messages are never acknowledged and will be redelivered.
fn decode_received(received: Vec<ReceivedMessage>) -> Vec<BusMessage> {
    received
        .into_iter()
        .filter_map(|rm| {
            match base64::engine::general_purpose::STANDARD.decode(rm.message.data.as_bytes()) {
                Ok(data) => Some(BusMessage {
                    ack_id: rm.ack_id,
                    message_id: rm.message.message_id,
                    data,
                    publish_time: rm.message.publish_time,
                    delivery_attempt: rm.delivery_attempt,
                }),
                Err(e) => {
                    warn!(
                        kind = "decode",
                        message_id = %rm.message.message_id,
                        error = %e,
                        "Pub/Sub message data is not valid base64, leaving unacknowledged"
                    );
                    None
                }
            }
        })
        .collect()
}

#[async_trait]
impl SubscriptionAdmin for PubSubClient {
    async fn create_subscription(&self, topic: &str, subscription: &str) -> Result<(), BusError> {
        let topic_path = self.topic_path(topic);
        let body = CreateSubscriptionRequest {
            topic: &topic_path,
            ack_deadline_seconds: self.ack_deadline_secs,
        };
        self.send(self.http.put(self.subscription_url(subscription)).json(&body))
            .await?;
        Ok(())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), BusError> {
        self.send(self.http.delete(self.subscription_url(subscription)))
            .await?;
        Ok(())
    }
}

/// A [`PubSubClient`] bound to one subscription.
#[derive(Clone)]
pub struct PubSubSubscriber {
    client: PubSubClient,
    subscription: String,
}

impl PubSubSubscriber {
    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

#[async_trait]
impl MessageSource for PubSubSubscriber {
    async fn pull(&self, max_messages: u32) -> Result<Vec<BusMessage>, BusError> {
        self.client.pull(&self.subscription, max_messages).await
    }

    async fn ack(&self, ack_id: &str) -> Result<(), BusError> {
        debug!(ack_id, "Acknowledging Pub/Sub message");
        self.client.acknowledge(&self.subscription, ack_id).await
    }
}
