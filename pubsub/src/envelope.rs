//! Inbound message types.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::QoS;

/// A message received from the broker, before decoding.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload.
    pub payload: Bytes,
    /// QoS level.
    pub qos: QoS,
    /// Retain flag.
    pub retain: bool,
    /// Packet ID (for QoS > 0).
    pub packet_id: Option<u16>,
    /// Unique id of this message instance, assigned on receipt.
    message_id: String,
    /// When the message was received.
    pub received_at: DateTime<Utc>,
}

impl Delivery {
    /// Create a new delivery with a fresh message id.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
            packet_id: None,
            message_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
        }
    }

    /// Set the QoS level.
    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    /// Set the retain flag.
    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    /// The message id assigned when this delivery was created.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }

    /// Envelope metadata of this delivery.
    pub fn envelope(&self) -> Envelope {
        Envelope {
            topic: self.topic.clone(),
            qos: self.qos,
            retain: self.retain,
            message_id: self.message_id.clone(),
            timestamp: self.received_at,
        }
    }
}

impl From<rumqttc::Publish> for Delivery {
    fn from(publish: rumqttc::Publish) -> Self {
        let packet_id = (publish.pkid != 0).then_some(publish.pkid);
        Self {
            topic: publish.topic,
            payload: publish.payload,
            qos: publish.qos.into(),
            retain: publish.retain,
            packet_id,
            message_id: Uuid::new_v4().to_string(),
            received_at: Utc::now(),
        }
    }
}

/// Broker metadata attached to a decoded message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub qos: QoS,
    pub retain: bool,
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A decoded message together with its envelope.
#[derive(Debug, Clone)]
pub struct Inbound<M> {
    pub envelope: Envelope,
    pub message: M,
}

impl<M> Inbound<M> {
    /// Topic the message arrived on.
    pub fn topic(&self) -> &str {
        &self.envelope.topic
    }

    /// Unique id of the message instance.
    pub fn message_id(&self) -> &str {
        &self.envelope.message_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_id_assigned_once() {
        let d = Delivery::new("a/b", "x");
        let first = d.message_id().to_string();
        let cloned = d.clone();
        assert_eq!(cloned.message_id(), first);
        assert_eq!(d.envelope().message_id, first);
        assert_ne!(Delivery::new("a/b", "x").message_id(), first);
    }

    #[test]
    fn test_from_publish() {
        let mut publish = rumqttc::Publish::new("dev/1/state", rumqttc::QoS::AtLeastOnce, "on");
        publish.pkid = 7;
        publish.retain = true;

        let d = Delivery::from(publish);
        assert_eq!(d.topic, "dev/1/state");
        assert_eq!(d.qos, QoS::AtLeastOnce);
        assert!(d.retain);
        assert_eq!(d.packet_id, Some(7));
        assert_eq!(d.payload_str(), Some("on"));
    }
}
