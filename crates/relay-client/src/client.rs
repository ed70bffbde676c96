//! The broker call contract.
//!
//! [`BrokerClient`] is the small fixed interface every broker host exposes
//! to producers and consumers. [`DirectClient`] implements it against an
//! in-process [`relay_core::Broker`]; a remote transport implements the same
//! trait out of tree.

use async_trait::async_trait;
use relay_core::{Broker, BrokerError, Message};
use std::sync::Arc;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The broker cannot be reached right now.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The request timed out.
    #[error("Request timed out")]
    Timeout,

    /// The broker rejected the request (validation, limits).
    #[error("Broker rejected the request: {0}")]
    Rejected(String),

    /// Every retry attempt failed.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        /// How many attempts were made.
        attempts: u32,
        /// The error from the final attempt.
        last_error: String,
    },

    /// Local store-and-forward persistence failure.
    #[error("Storage error: {0}")]
    Storage(#[from] relay_store::StoreError),
}

impl ClientError {
    /// Whether this error may succeed on retry.
    ///
    /// Connectivity problems and timeouts are transient; rejections and
    /// local storage failures are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout)
    }
}

/// The fixed call contract a broker host exposes.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Publish a message.
    ///
    /// A duplicate identifier counts as acknowledged: the broker already
    /// holds the message, which is exactly what a store-and-forward resend
    /// wants to know.
    async fn publish(&self, message: &Message) -> Result<(), ClientError>;

    /// Poll unseen messages for a consumer group.
    async fn poll(&self, topic: &str, group: &str) -> Result<Vec<Message>, ClientError>;

    /// Check that the broker is reachable and accepting traffic.
    async fn health(&self) -> Result<(), ClientError>;
}

/// In-process client for an embedded broker.
#[derive(Clone)]
pub struct DirectClient {
    broker: Arc<Broker>,
}

impl DirectClient {
    /// Create a client wrapping an in-process broker.
    #[must_use]
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}

fn map_broker_error(e: BrokerError) -> ClientError {
    match e {
        BrokerError::NotRunning => ClientError::Unavailable("broker is not running".to_string()),
        BrokerError::Storage(e) => ClientError::Unavailable(e.to_string()),
        other => ClientError::Rejected(other.to_string()),
    }
}

#[async_trait]
impl BrokerClient for DirectClient {
    async fn publish(&self, message: &Message) -> Result<(), ClientError> {
        // Ok(false) is a duplicate, treated as acknowledged.
        self.broker
            .publish(&message.topic, message.clone())
            .map(|_| ())
            .map_err(map_broker_error)
    }

    async fn poll(&self, topic: &str, group: &str) -> Result<Vec<Message>, ClientError> {
        self.broker.poll(topic, group).map_err(map_broker_error)
    }

    async fn health(&self) -> Result<(), ClientError> {
        if self.broker.is_running() {
            Ok(())
        } else {
            Err(ClientError::Unavailable("broker is not running".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_store::DurableStore;

    fn direct_client(dir: &tempfile::TempDir) -> DirectClient {
        let store = Arc::new(DurableStore::open(dir.path().join("data")).unwrap());
        let broker = Arc::new(Broker::new(store));
        broker.start().unwrap();
        DirectClient::new(broker)
    }

    #[tokio::test]
    async fn test_direct_client_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let client = direct_client(&dir);

        client.health().await.unwrap();
        client
            .publish(&Message::new("orders", b"x".to_vec()))
            .await
            .unwrap();

        let batch = client.poll("orders", "analytics").await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0].payload[..], b"x");
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_acknowledged() {
        let dir = tempfile::tempdir().unwrap();
        let client = direct_client(&dir);

        let message = Message::new("orders", b"x".to_vec());
        client.publish(&message).await.unwrap();
        client.publish(&message).await.unwrap();

        assert_eq!(client.poll("orders", "analytics").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stopped_broker_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path().join("data")).unwrap());
        let broker = Arc::new(Broker::new(store));
        let client = DirectClient::new(broker);

        let err = client.health().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_validation_error_is_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let client = direct_client(&dir);

        let err = client
            .publish(&Message::new("orders", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected(_)));
        assert!(!err.is_transient());
    }
}
