//! Topic abstraction for Relay.
//!
//! A topic is a named, append-only, time-ordered sequence of messages. It is
//! safe for concurrent append and concurrent full-sequence reads; messages
//! are never reordered or removed except by an explicit clear.

use crate::message::Message;
use std::sync::RwLock;
use tracing::{debug, trace};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Maximum consumer-group name length.
pub const MAX_GROUP_NAME_LENGTH: usize = 256;

/// A topic identifier.
pub type TopicName = String;

/// Validate a topic name.
///
/// Topic names become directory components in the durable store, so path
/// separators are rejected along with the usual character rules.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    validate_name(name, MAX_TOPIC_NAME_LENGTH, "Topic")
}

/// Validate a consumer-group name.
///
/// Group names become cursor file names in the durable store and follow the
/// same rules as topic names.
///
/// # Errors
///
/// Returns an error message if the group name is invalid.
pub fn validate_group_name(name: &str) -> Result<(), &'static str> {
    validate_name(name, MAX_GROUP_NAME_LENGTH, "Group")
}

fn validate_name(name: &str, max_len: usize, _kind: &'static str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Name cannot be empty");
    }
    if name.len() > max_len {
        return Err("Name too long");
    }
    if name.starts_with('$') {
        return Err("Names starting with '$' are reserved");
    }
    if name.contains('/') || name.contains('\\') {
        return Err("Name cannot contain path separators");
    }
    if name == "." || name == ".." {
        return Err("Name cannot be a relative path component");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Name contains invalid characters");
    }
    Ok(())
}

/// An append-only topic queue.
#[derive(Debug)]
pub struct Topic {
    /// Topic name.
    name: TopicName,
    /// Messages in arrival order.
    messages: RwLock<Vec<Message>>,
}

impl Topic {
    /// Create a new empty topic.
    #[must_use]
    pub fn new(name: impl Into<TopicName>) -> Self {
        Self {
            name: name.into(),
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a message to the topic.
    pub fn push(&self, message: Message) {
        trace!(topic = %self.name, id = %message.id, "Appending message");
        self.messages
            .write()
            .expect("topic lock poisoned")
            .push(message);
    }

    /// Get a snapshot of the full message sequence.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages
            .read()
            .expect("topic lock poisoned")
            .clone()
    }

    /// Get the number of messages in the topic.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.read().expect("topic lock poisoned").len()
    }

    /// Check if the topic has no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all messages from the topic.
    pub fn clear(&self) {
        let mut messages = self.messages.write().expect("topic lock poisoned");
        debug!(topic = %self.name, removed = messages.len(), "Clearing topic");
        messages.clear();
    }
}
