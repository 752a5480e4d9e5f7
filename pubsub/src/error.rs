//! Error types for the pubsub library.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Error type for pubsub operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or invalid connection settings.
    #[error("pubsub: configuration error: {0}")]
    Configuration(String),

    /// No connection with the requested name is configured.
    #[error("pubsub: connection {0:?} is not configured")]
    UnknownConnection(String),

    /// Handshake or transport failure.
    #[error("pubsub: connection error: {0}")]
    Connection(String),

    /// A broker request did not finish in time.
    #[error("pubsub: {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Subscribe or unsubscribe request failed.
    #[error("pubsub: subscribe error: {0}")]
    Subscribe(String),

    /// Publish request failed.
    #[error("pubsub: publish error: {0}")]
    Publish(String),

    /// A message could not be encoded.
    #[error("pubsub: serialization error: {0}")]
    Serialization(String),

    /// A payload could not be decoded into the expected message type.
    #[error("pubsub: deserialization error: {0}")]
    Deserialization(String),

    /// A filter, handler or transformer failed.
    #[error("pubsub: pipeline {pipeline}: {reason}")]
    Pipeline { pipeline: String, reason: String },

    /// Reading or writing a persisted record failed.
    #[error("pubsub: persistence error: {0}")]
    Persistence(#[from] StoreError),

    /// The persisted record was already acknowledged and cannot be saved again.
    #[error("pubsub: message {0} is already acknowledged")]
    AlreadyAcknowledged(String),

    /// A topic group with this name already exists.
    #[error("pubsub: topic group {0:?} already exists")]
    DuplicateGroup(String),

    /// A topic group with this name does not exist.
    #[error("pubsub: topic group {0:?} not found")]
    GroupNotFound(String),

    /// Invalid topic or topic pattern.
    #[error("pubsub: invalid topic pattern: {0:?}")]
    InvalidTopicPattern(String),

    /// TLS setup failed.
    #[error("pubsub: tls error: {0}")]
    Tls(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for pubsub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Runs `fut` with a deadline, mapping expiry to [`Error::Timeout`].
pub(crate) async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::Timeout { operation, after }),
    }
}
