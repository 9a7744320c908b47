use async_trait::async_trait;
use futures::Stream;
use meshcell_core::{topics, Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One message as carried by the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BusMessage {
    pub topic: String,
    /// Implicit reply channel for request/reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl BusMessage {
    pub fn new(topic: &str, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.to_string(),
            reply_to: None,
            payload,
        }
    }

    pub fn with_reply_to(mut self, reply_to: &str) -> Self {
        self.reply_to = Some(reply_to.to_string());
        self
    }

    /// Decode the payload, mapping failures to a validation error.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            Error::Validation(format!("malformed payload on '{}': {}", self.topic, e))
        })
    }
}

/// A live subscription. Messages arrive in publish order per publisher and topic.
///
/// Dropping the subscription cancels it. `recv` returning `None` means the bus
/// closed the subscription (shutdown or connection budget exhausted).
pub struct Subscription {
    pattern: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        pattern: &str,
        rx: mpsc::UnboundedReceiver<BusMessage>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            pattern: pattern.to_string(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Stream for Subscription {
    type Item = BusMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Contract over a publish/subscribe transport.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Best-effort, unacknowledged publish.
    async fn publish_message(&self, message: BusMessage) -> Result<()>;

    /// Open a subscription on a pattern (`*` = one token, trailing `>` = the rest).
    async fn subscribe(&self, pattern: &str) -> Result<Subscription>;

    /// Resolve once everything published so far has left this process.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        self.publish_message(BusMessage::new(topic, payload)).await
    }

    /// Answer a request on its reply channel. Messages without one are ignored.
    async fn reply(&self, request: &BusMessage, payload: serde_json::Value) -> Result<()> {
        match request.reply_to.as_deref() {
            Some(reply_to) => self.publish(reply_to, payload).await,
            None => {
                debug!(topic = %request.topic, "No reply channel on message, dropping reply");
                Ok(())
            }
        }
    }

    /// Publish and wait for the first reply. The inbox subscription is released
    /// on every path, reply or timeout.
    async fn request(
        &self,
        topic: &str,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<BusMessage> {
        let inbox = topics::inbox();
        let mut replies = self.subscribe(&inbox).await?;
        self.publish_message(BusMessage::new(topic, payload).with_reply_to(&inbox))
            .await?;

        match tokio::time::timeout(timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) => Err(Error::Closed(format!(
                "bus closed while waiting for reply on '{}'",
                topic
            ))),
            Err(_) => Err(Error::Timeout(format!(
                "no reply on '{}' within {}ms",
                topic,
                timeout.as_millis()
            ))),
        }
    }
}

/// Produces a connected bus. Connection retries live behind this seam.
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Bus>>;
}
