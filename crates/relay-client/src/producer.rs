//! Producer-side store-and-forward queue.
//!
//! Every outgoing message is durably recorded in the producer's own store
//! directory before the send is attempted; the record is deleted only once
//! the broker acknowledges the message. A producer restart replays whatever
//! records are still present, in timestamp order, before new input.

use crate::client::{BrokerClient, ClientError};
use relay_core::Message;
use relay_store::DurableStore;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Retry behavior for sends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum send attempts before giving up.
    pub max_attempts: u32,
    /// Base backoff delay; attempt `n` waits `base_delay * n`.
    pub base_delay: Duration,
    /// Per-call timeout for a single send.
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// A local store-and-forward buffer in front of a broker client.
///
/// Exhausting every retry leaves the record on disk for the next replay; a
/// message is never silently dropped.
pub struct ProducerQueue<C> {
    store: DurableStore<Message>,
    client: C,
    policy: RetryPolicy,
}

impl<C: BrokerClient> ProducerQueue<C> {
    /// Open a producer queue rooted at the given local directory.
    ///
    /// The directory belongs to this producer alone; it is not the broker's
    /// storage root.
    ///
    /// # Errors
    ///
    /// Returns an error if the local store cannot be opened.
    pub fn open(
        root: impl Into<PathBuf>,
        client: C,
        policy: RetryPolicy,
    ) -> Result<Self, ClientError> {
        let store = DurableStore::open(root)?;
        Ok(Self {
            store,
            client,
            policy,
        })
    }

    /// Get the number of locally recorded, not-yet-acknowledged messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.store
            .topics()
            .iter()
            .map(|t| self.store.record_count(t))
            .sum()
    }

    /// Persist a message locally, then send it with retries.
    ///
    /// On acknowledgment the local record is removed. On retry exhaustion
    /// the record stays in place and the error is surfaced.
    ///
    /// # Errors
    ///
    /// Returns an error if local persistence fails, the broker rejects the
    /// message, or every retry attempt fails.
    pub async fn enqueue(&self, message: Message) -> Result<(), ClientError> {
        // Persist before any network attempt; a duplicate means the record
        // is already pending from an earlier attempt.
        self.store.save(&message)?;
        self.send_and_ack(&message).await
    }

    /// Replay all still-present records in timestamp order.
    ///
    /// Called on producer startup before accepting new input, and usable as
    /// a manual retry trigger. Returns the number of records delivered.
    ///
    /// # Errors
    ///
    /// Stops at the first record whose retries are exhausted or that the
    /// broker rejects, leaving it and everything after it in place.
    pub async fn replay(&self) -> Result<usize, ClientError> {
        let records = self.store.load_all()?;
        if records.is_empty() {
            return Ok(0);
        }

        info!(pending = records.len(), "Replaying producer queue");
        let mut sent = 0usize;
        for message in records {
            self.send_and_ack(&message).await?;
            sent += 1;
        }
        Ok(sent)
    }

    async fn send_and_ack(&self, message: &Message) -> Result<(), ClientError> {
        self.send_with_retry(message).await?;
        self.store.remove(&message.topic, message.id)?;
        debug!(topic = %message.topic, id = %message.id, "Message acknowledged");
        Ok(())
    }

    async fn send_with_retry(&self, message: &Message) -> Result<(), ClientError> {
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_attempts {
            match timeout(self.policy.request_timeout, self.client.publish(message)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = ClientError::Timeout.to_string(),
            }

            if attempt < self.policy.max_attempts {
                // Linear backoff: base_delay * attempt number.
                let delay = self.policy.base_delay * attempt;
                warn!(
                    topic = %message.topic,
                    id = %message.id,
                    attempt,
                    error = %last_error,
                    "Send failed, backing off"
                );
                sleep(delay).await;
            }
        }

        Err(ClientError::RetriesExhausted {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Test client that fails the first `failures` sends, then accepts.
    #[derive(Default)]
    struct FlakyClient {
        failures: AtomicU32,
        sent: Mutex<Vec<Message>>,
    }

    impl FlakyClient {
        fn failing(times: u32) -> Self {
            Self {
                failures: AtomicU32::new(times),
                ..Self::default()
            }
        }

        fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerClient for &FlakyClient {
        async fn publish(&self, message: &Message) -> Result<(), ClientError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(ClientError::Unavailable("connection refused".to_string()));
            }
            self.sent.lock().unwrap().push(message.clone());
            Ok(())
        }

        async fn poll(&self, _topic: &str, _group: &str) -> Result<Vec<Message>, ClientError> {
            Ok(Vec::new())
        }

        async fn health(&self) -> Result<(), ClientError> {
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            request_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_enqueue_sends_and_removes_record() {
        let dir = tempfile::tempdir().unwrap();
        let client = FlakyClient::default();
        let queue = ProducerQueue::open(dir.path().join("outbox"), &client, fast_policy(3)).unwrap();

        queue.enqueue(Message::new("orders", b"x".to_vec())).await.unwrap();
        assert_eq!(client.sent().len(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_retries_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let client = FlakyClient::failing(2);
        let queue = ProducerQueue::open(dir.path().join("outbox"), &client, fast_policy(3)).unwrap();

        queue.enqueue(Message::new("orders", b"x".to_vec())).await.unwrap();
        assert_eq!(client.sent().len(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_exhaustion_leaves_record_for_replay() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("outbox");

        let client = FlakyClient::failing(10);
        let queue = ProducerQueue::open(&outbox, &client, fast_policy(2)).unwrap();

        let err = queue
            .enqueue(Message::new("orders", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::RetriesExhausted { attempts: 2, .. }));
        assert_eq!(queue.pending(), 1);

        // Simulated producer restart with a healthy broker: the record is
        // still there and replays successfully.
        let client = FlakyClient::default();
        let queue = ProducerQueue::open(&outbox, &client, fast_policy(2)).unwrap();
        assert_eq!(queue.replay().await.unwrap(), 1);
        assert_eq!(client.sent().len(), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_replay_preserves_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let outbox = dir.path().join("outbox");

        let client = FlakyClient::failing(100);
        let queue = ProducerQueue::open(&outbox, &client, fast_policy(1)).unwrap();
        for (ts, body) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let message = Message::new("orders", body.as_bytes().to_vec()).with_timestamp(ts);
            let _ = queue.enqueue(message).await;
        }
        assert_eq!(queue.pending(), 3);

        let client = FlakyClient::default();
        let queue = ProducerQueue::open(&outbox, &client, fast_policy(1)).unwrap();
        assert_eq!(queue.replay().await.unwrap(), 3);

        let bodies: Vec<Vec<u8>> = client.sent().iter().map(|m| m.payload.to_vec()).collect();
        assert_eq!(bodies, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn test_replay_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let client = FlakyClient::default();
        let queue = ProducerQueue::open(dir.path().join("outbox"), &client, fast_policy(1)).unwrap();
        assert_eq!(queue.replay().await.unwrap(), 0);
    }
}
