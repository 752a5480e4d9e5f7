//! Typed publishing with an optional durable outbox.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result, with_timeout};
use crate::outbox::Outbox;
use crate::registry::ConnectionRegistry;
use crate::types::QoS;

/// A message type with a default topic.
///
/// ```
/// use giztoy_pubsub::{PublishMessage, QoS};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Heartbeat {
///     uptime: u64,
/// }
///
/// impl PublishMessage for Heartbeat {
///     const TOPIC: &'static str = "devices/heartbeat";
///     const QOS: QoS = QoS::AtLeastOnce;
/// }
/// ```
pub trait PublishMessage: Serialize + Send + Sync {
    const TOPIC: &'static str;
    const QOS: QoS = QoS::AtMostOnce;
    const RETAIN: bool = false;
}

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub topic: Option<String>,
    pub qos: Option<QoS>,
    pub retain: Option<bool>,
    /// Connection name; `None` uses the default connection.
    pub connection: Option<String>,
    /// Message id; a random one is assigned when `None`.
    pub message_id: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = Some(retain);
        self
    }

    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Publishes messages through the registry's publish clients.
///
/// With an outbox attached, every message is saved before it is sent and
/// stays pending until [`Publisher::acknowledge`] is called for its id.
pub struct Publisher {
    connections: Arc<ConnectionRegistry>,
    outbox: Option<Arc<Outbox>>,
    timeout: Duration,
}

impl Publisher {
    pub fn new(connections: Arc<ConnectionRegistry>) -> Self {
        let timeout = connections.settings().timeouts.operation();
        Self {
            connections,
            outbox: None,
            timeout,
        }
    }

    /// Attach an outbox.
    pub fn with_outbox(mut self, outbox: Arc<Outbox>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    pub fn outbox(&self) -> Option<&Arc<Outbox>> {
        self.outbox.as_ref()
    }

    /// Publish `message` with its declared topic, QoS and retain flag.
    /// Returns the message id.
    pub async fn publish<M: PublishMessage>(&self, message: &M) -> Result<String> {
        self.publish_with(message, PublishOptions::default()).await
    }

    /// Publish `message`, overriding its declaration with `options`.
    pub async fn publish_with<M: PublishMessage>(
        &self,
        message: &M,
        options: PublishOptions,
    ) -> Result<String> {
        let payload = serde_json::to_vec(message).map_err(|e| Error::Serialization(e.to_string()))?;
        let options = PublishOptions {
            topic: Some(options.topic.unwrap_or_else(|| M::TOPIC.to_string())),
            qos: Some(options.qos.unwrap_or(M::QOS)),
            retain: Some(options.retain.unwrap_or(M::RETAIN)),
            ..options
        };
        let topic = options.topic.clone().unwrap_or_default();
        self.publish_bytes(&topic, payload, options).await
    }

    /// Publish a raw payload. Unset options default to QoS 0, no retain.
    pub async fn publish_bytes(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> Result<String> {
        if topic.is_empty() || topic.contains(['+', '#']) {
            return Err(Error::InvalidTopicPattern(topic.to_string()));
        }
        let payload = payload.into();
        let qos = options.qos.unwrap_or_default();
        let retain = options.retain.unwrap_or(false);
        let message_id = options
            .message_id
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(outbox) = &self.outbox {
            outbox.save_message(topic, payload.clone(), qos, retain, &message_id)?;
        }

        let client = self
            .connections
            .publish_client(options.connection.as_deref())
            .await?;
        with_timeout(
            "publish",
            self.timeout,
            client.publish(topic, payload, qos, retain),
        )
        .await?;

        debug!(topic, message_id = %message_id, qos = qos.level(), retain, "published");
        Ok(message_id)
    }

    /// Mark an outbox record delivered. Returns `Ok(false)` for an unknown id.
    pub fn acknowledge(&self, message_id: &str) -> Result<bool> {
        match &self.outbox {
            Some(outbox) => outbox.mark_acknowledged(message_id),
            None => Err(Error::Configuration("publisher has no outbox".into())),
        }
    }

    /// Send every pending outbox record again, oldest first, on the default
    /// connection.
    ///
    /// Records stay pending until acknowledged. Failed sends are logged and
    /// skipped; the number of records sent is returned.
    pub async fn republish_pending(&self) -> Result<usize> {
        let Some(outbox) = &self.outbox else {
            return Err(Error::Configuration("publisher has no outbox".into()));
        };

        let pending = outbox.pending_messages()?;
        if pending.is_empty() {
            return Ok(0);
        }

        let client = self.connections.publish_client(None).await?;
        let mut sent = 0;
        for record in pending {
            let res = with_timeout(
                "publish",
                self.timeout,
                client.publish(&record.topic, record.payload.clone(), record.qos, record.retain),
            )
            .await;
            match res {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(message_id = %record.message_id, topic = %record.topic, error = %e, "republish failed");
                }
            }
        }
        info!(sent, "pending messages republished");
        Ok(sent)
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("outbox", &self.outbox.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
