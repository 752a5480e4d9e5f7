//! Publish/subscribe messaging over named MQTT connections.
//!
//! This crate provides:
//!
//! - [`ConnectionRegistry`]: lazily opened publish and subscribe clients
//!   per configured connection, with TLS and credentials,
//! - [`ConsumerRegistry`]: typed [`Consumer`]s subscribed to their topics,
//!   each feeding a [`Pipeline`] of filters, a handler and transformers,
//! - [`Publisher`] with an at-least-once [`Outbox`],
//! - [`TopicGroupManager`] and the wildcard matcher in [`topic`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use async_trait::async_trait;
//! use giztoy_pubsub::{
//!     ConnectionRegistry, Consumer, ConsumerDescriptor, ConsumerRegistry, Inbound, Publisher,
//!     Settings, Subscription,
//! };
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Status {
//!     online: bool,
//! }
//!
//! #[derive(Default)]
//! struct StatusConsumer;
//!
//! #[async_trait]
//! impl Consumer for StatusConsumer {
//!     type Message = Status;
//!
//!     fn subscription(&self) -> Subscription {
//!         Subscription::new("devices/status")
//!     }
//!
//!     async fn handle(&self, msg: &Inbound<Status>) -> anyhow::Result<()> {
//!         println!("{} online={}", msg.topic(), msg.message.online);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load("pubsub.yaml")?;
//!     let connections = Arc::new(ConnectionRegistry::new(settings)?);
//!
//!     let consumers = ConsumerRegistry::new(connections.clone());
//!     consumers.init([ConsumerDescriptor::of::<StatusConsumer>()]).await?;
//!
//!     let publisher = Publisher::new(connections.clone());
//!     publisher
//!         .publish_bytes("devices/status", r#"{"online":true}"#, Default::default())
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     consumers.shutdown(Duration::from_secs(5)).await?;
//!     connections.shutdown(Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```

mod client;
mod config;
mod consumer;
mod envelope;
mod error;
mod group;
#[cfg(test)]
mod mock;
mod outbox;
mod pipeline;
mod publisher;
mod registry;
pub mod store;
mod tls;
pub mod topic;
mod types;

pub use client::{
    BrokerClient, ConnectOptions, Connector, ListenerId, MessageCallback, MqttClient,
    MqttConnector,
};
pub use config::{ConnectionConfig, Endpoint, Settings, Timeouts, TlsSettings};
pub use consumer::{Consumer, ConsumerDescriptor, ConsumerRegistry, Subscription};
pub use envelope::{Delivery, Envelope, Inbound};
pub use error::{Error, Result};
pub use group::{TopicGroup, TopicGroupManager};
pub use outbox::{Outbox, PersistedMessage};
pub use pipeline::{
    Filter, FnHandler, FnStage, Handler, Outcome, Pipeline, Stage, handler_fn, stage_fn,
};
pub use publisher::{PublishMessage, PublishOptions, Publisher};
pub use registry::ConnectionRegistry;
pub use tls::{certificate_fingerprint, client_config as tls_client_config};
pub use types::{QoS, Role};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::{
        ConnectionRegistry, Consumer, ConsumerDescriptor, ConsumerRegistry, Error, Inbound,
        Pipeline, PublishMessage, PublishOptions, Publisher, QoS, Result, Settings, Subscription,
    };
}
