//! Consumer registration tracking for Relay.
//!
//! Registrations are ephemeral session state: they record which consumers
//! belong to which (topic, group) cohort, but a missing registration never
//! blocks a group from polling. Nothing here is persisted.

use crate::message::now_millis;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single consumer registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Consumer identifier.
    pub consumer_id: String,
    /// Topic the consumer polls.
    pub topic: String,
    /// Consumer group the consumer belongs to.
    pub group: String,
    /// Registration timestamp, UTC milliseconds.
    pub registered_at: u64,
}

impl Registration {
    /// Create a new registration stamped with the current time.
    #[must_use]
    pub fn new(
        consumer_id: impl Into<String>,
        topic: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            topic: topic.into(),
            group: group.into(),
            registered_at: now_millis(),
        }
    }
}

/// Tracker for active consumer registrations.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    registrations: Vec<Registration>,
}

impl ConsumerRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of registrations.
    #[must_use]
    pub fn count(&self) -> usize {
        self.registrations.len()
    }

    /// Register a consumer.
    ///
    /// Returns `false` if the (topic, group, consumer) triple is already
    /// registered.
    pub fn register(&mut self, topic: &str, group: &str, consumer_id: &str) -> bool {
        let exists = self.registrations.iter().any(|r| {
            r.topic == topic && r.group == group && r.consumer_id == consumer_id
        });
        if exists {
            return false;
        }

        self.registrations
            .push(Registration::new(consumer_id, topic, group));
        debug!(topic = %topic, group = %group, consumer = %consumer_id, "Consumer registered");
        true
    }

    /// Unregister a consumer.
    ///
    /// Removes the first matching registration across all topics. Returns
    /// `false` if none was found.
    pub fn unregister(&mut self, consumer_id: &str) -> bool {
        let Some(pos) = self
            .registrations
            .iter()
            .position(|r| r.consumer_id == consumer_id)
        else {
            return false;
        };

        let removed = self.registrations.remove(pos);
        debug!(
            topic = %removed.topic,
            group = %removed.group,
            consumer = %consumer_id,
            "Consumer unregistered"
        );
        true
    }

    /// List consumer IDs registered under a (topic, group) pair.
    #[must_use]
    pub fn list(&self, topic: &str, group: &str) -> Vec<String> {
        self.registrations
            .iter()
            .filter(|r| r.topic == topic && r.group == group)
            .map(|r| r.consumer_id.clone())
            .collect()
    }

    /// Get a snapshot of all registrations.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Registration> {
        self.registrations.clone()
    }
}
