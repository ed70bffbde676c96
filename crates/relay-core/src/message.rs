//! Message types for Relay.
//!
//! A message is immutable once created and flows unchanged from the producer
//! through the store to every consumer group.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A unique message identifier (128-bit).
pub type MessageId = Uuid;

/// Generate a new message ID.
#[must_use]
pub fn generate_message_id() -> MessageId {
    Uuid::new_v4()
}

/// Current UTC time in milliseconds since the epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A message flowing through the broker.
///
/// The identifier is unique within a topic; the payload may be empty but is
/// never absent. A nil identifier means "not yet assigned" and is replaced
/// by the broker at publish time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    /// Unique message identifier.
    pub id: MessageId,
    /// Target topic.
    pub topic: String,
    /// Originating consumer-group hint (producer-side routing only, never
    /// used for broker fan-out).
    pub group: Option<String>,
    /// Informational priority; not currently used for ordering.
    pub priority: i32,
    /// Opaque payload.
    pub payload: Bytes,
    /// Creation timestamp, UTC milliseconds.
    pub timestamp: u64,
}

impl Message {
    /// Create a new message with a generated identifier and timestamp.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: generate_message_id(),
            topic: topic.into(),
            group: None,
            priority: 0,
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Set an explicit identifier.
    #[must_use]
    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    /// Set the consumer-group hint.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set an explicit creation timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Get the payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }
}

impl relay_store::Record for Message {
    fn record_id(&self) -> Uuid {
        self.id
    }

    fn record_topic(&self) -> &str {
        &self.topic
    }

    fn record_timestamp(&self) -> u64 {
        self.timestamp
    }
}
