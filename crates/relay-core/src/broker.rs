//! The broker core for Relay.
//!
//! The broker owns the in-memory topic queues, the consumer registry, and
//! the per-(topic, group) delivery cursors, delegating all persistence to
//! [`relay_store::DurableStore`]. Operations on different topics never block
//! each other, and operations on different groups within a topic only
//! contend on their own cursor.

use crate::message::{generate_message_id, Message};
use crate::registry::ConsumerRegistry;
use crate::topic::{validate_group_name, validate_topic_name, Topic};
use dashmap::DashMap;
use relay_store::{DurableStore, StoreError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Operation invoked while the broker is stopped.
    #[error("Broker is not running")]
    NotRunning,

    /// Invalid topic name.
    #[error("Invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// Invalid consumer-group name.
    #[error("Invalid group name: {0}")]
    InvalidGroup(&'static str),

    /// Invalid consumer identifier.
    #[error("Invalid consumer id: {0}")]
    InvalidConsumer(&'static str),

    /// Publish with an empty payload.
    #[error("Message payload cannot be empty")]
    EmptyPayload,

    /// Publish exceeding the configured payload limit.
    #[error("Message payload of {0} bytes exceeds maximum {1}")]
    PayloadTooLarge(usize, usize),

    /// Topic limit reached.
    #[error("Maximum number of topics reached")]
    MaxTopicsReached,

    /// Persistence failure.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of topics.
    pub max_topics: usize,
    /// Maximum message payload size in bytes.
    pub max_message_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_message_size: 64 * 1024,
        }
    }
}

/// Delivery cursor for one (topic, group) pair.
///
/// `dirty` marks a delivered-set that is ahead of its persisted copy after
/// a failed cursor write; the next poll retries the write.
#[derive(Debug, Default)]
struct GroupCursor {
    delivered: HashSet<Uuid>,
    dirty: bool,
}

type CursorRef = Arc<Mutex<GroupCursor>>;

/// The broker core.
///
/// Topics and cursors live in lock-free maps; the only exclusive critical
/// section is the read-then-mark step of [`Broker::poll`] on a single
/// group's cursor.
pub struct Broker {
    /// Topic queues indexed by name.
    topics: DashMap<String, Arc<Topic>>,
    /// Delivery cursors indexed by (topic, group).
    cursors: DashMap<(String, String), CursorRef>,
    /// Active consumer registrations.
    registry: Mutex<ConsumerRegistry>,
    /// Durable persistence layer.
    store: Arc<DurableStore<Message>>,
    /// Configuration.
    config: BrokerConfig,
    /// Whether the broker accepts traffic.
    running: AtomicBool,
    /// Serializes start/stop transitions.
    lifecycle: Mutex<()>,
}

impl Broker {
    /// Create a new broker with default configuration.
    ///
    /// The broker starts stopped; call [`Broker::start`] to replay the store
    /// and begin accepting traffic.
    #[must_use]
    pub fn new(store: Arc<DurableStore<Message>>) -> Self {
        Self::with_config(store, BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(store: Arc<DurableStore<Message>>, config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            topics: DashMap::new(),
            cursors: DashMap::new(),
            registry: Mutex::new(ConsumerRegistry::new()),
            store,
            config,
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    /// Check whether the broker is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the broker, replaying the durable store first. Idempotent.
    ///
    /// In-memory state is rebuilt from scratch so a stopped broker can be
    /// restarted against whatever the store now holds.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be scanned; individually corrupt
    /// records are skipped by the store, not surfaced here.
    pub fn start(&self) -> Result<(), BrokerError> {
        let _lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.topics.clear();
        self.cursors.clear();

        let records = self.store.load_all()?;
        let count = records.len();
        for message in records {
            // load_all returns ascending timestamp order, preserving
            // delivery order within each topic.
            let topic = self
                .topics
                .entry(message.topic.clone())
                .or_insert_with(|| Arc::new(Topic::new(message.topic.clone())))
                .clone();
            topic.push(message);
        }
        for name in self.store.topics() {
            self.topics
                .entry(name.clone())
                .or_insert_with(|| Arc::new(Topic::new(name)));
        }

        self.running.store(true, Ordering::SeqCst);
        info!(topics = self.topics.len(), messages = count, "Broker started");
        Ok(())
    }

    /// Stop the broker. Idempotent.
    ///
    /// New operations fail with [`BrokerError::NotRunning`]; cursors are
    /// flushed so a clean restart does not redeliver.
    pub fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().expect("lifecycle lock poisoned");
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.flush_cursors();
        info!("Broker stopped");
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(BrokerError::NotRunning)
        }
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_count: self.topics.len(),
            message_count: self.topics.iter().map(|t| t.value().len()).sum(),
            group_count: self.cursors.len(),
            consumer_count: self.registry.lock().expect("registry lock poisoned").count(),
        }
    }

    /// Register a consumer under a (topic, group) pair.
    ///
    /// Creates the topic implicitly. Returns `false` if the exact triple is
    /// already registered; the group's delivery cursor is created lazily on
    /// first poll, not here.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is stopped or a name is invalid.
    pub fn register_consumer(
        &self,
        topic: &str,
        group: &str,
        consumer_id: &str,
    ) -> Result<bool, BrokerError> {
        self.ensure_running()?;
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;
        validate_group_name(group).map_err(BrokerError::InvalidGroup)?;
        if consumer_id.is_empty() {
            return Err(BrokerError::InvalidConsumer("Consumer id cannot be empty"));
        }

        self.get_or_create_topic(topic)?;
        let registered = self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .register(topic, group, consumer_id);
        Ok(registered)
    }

    /// Unregister a consumer, removing its first matching registration.
    ///
    /// Returns `false` if the consumer was not registered anywhere.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is stopped.
    pub fn unregister_consumer(&self, consumer_id: &str) -> Result<bool, BrokerError> {
        self.ensure_running()?;
        Ok(self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .unregister(consumer_id))
    }

    /// List consumer IDs registered under a (topic, group) pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is stopped.
    pub fn list_consumers(&self, topic: &str, group: &str) -> Result<Vec<String>, BrokerError> {
        self.ensure_running()?;
        Ok(self
            .registry
            .lock()
            .expect("registry lock poisoned")
            .list(topic, group))
    }

    /// Publish a message to a topic.
    ///
    /// The message is persisted synchronously before it is admitted to the
    /// in-memory queue; the queue never holds a message the store does not.
    /// A nil identifier is replaced with a generated one. Returns `false`
    /// if the identifier already exists in the topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is stopped, validation fails, or
    /// persistence fails.
    pub fn publish(&self, topic: &str, mut message: Message) -> Result<bool, BrokerError> {
        self.ensure_running()?;
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;
        if message.payload.is_empty() {
            return Err(BrokerError::EmptyPayload);
        }
        if message.payload.len() > self.config.max_message_size {
            return Err(BrokerError::PayloadTooLarge(
                message.payload.len(),
                self.config.max_message_size,
            ));
        }

        if message.id.is_nil() {
            message.id = generate_message_id();
        }
        message.topic = topic.to_string();

        // Resolve the topic before touching the store: a publish rejected by
        // the topic limit must not leave a durable record behind.
        let queue = self.get_or_create_topic(topic)?;

        if !self.store.save(&message)? {
            debug!(topic = %topic, id = %message.id, "Duplicate publish rejected");
            return Ok(false);
        }

        trace!(topic = %topic, id = %message.id, "Message published");
        queue.push(message);
        Ok(true)
    }

    /// Poll unseen messages for a consumer group.
    ///
    /// Computes the difference between the topic's message sequence and the
    /// group's delivered set, marks the batch delivered, and persists the
    /// cursor off the polling path. Returns an empty list when nothing is
    /// pending. Messages are ordered by ascending creation timestamp.
    ///
    /// The cursor is created lazily here, seeded from the persisted
    /// delivered-set if one exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is stopped or a name is invalid; a
    /// cursor persistence failure is not an error (the write is retried on
    /// the next poll).
    pub fn poll(&self, topic: &str, group: &str) -> Result<Vec<Message>, BrokerError> {
        self.ensure_running()?;
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;
        validate_group_name(group).map_err(BrokerError::InvalidGroup)?;

        let snapshot = match self.topics.get(topic) {
            Some(queue) => queue.snapshot(),
            None => Vec::new(),
        };

        let cursor = self.cursor(topic, group);
        let mut batch = Vec::new();
        let retry_pending;
        {
            // Exclusive read-then-mark step: two concurrent pollers for the
            // same group cannot both claim a message.
            let mut guard = cursor.lock().expect("cursor lock poisoned");
            for message in snapshot {
                if guard.delivered.insert(message.id) {
                    batch.push(message);
                }
            }
            retry_pending = guard.dirty;
        }

        batch.sort_by_key(|m| m.timestamp);

        if !batch.is_empty() || retry_pending {
            self.spawn_cursor_persist(topic, group, cursor);
        }

        trace!(topic = %topic, group = %group, delivered = batch.len(), "Poll complete");
        Ok(batch)
    }

    /// Delete all messages and cursors for a topic, in memory and on disk.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is stopped or the topic directory
    /// cannot be removed.
    pub fn clear_topic(&self, topic: &str) -> Result<(), BrokerError> {
        self.ensure_running()?;
        validate_topic_name(topic).map_err(BrokerError::InvalidTopic)?;

        self.topics.remove(topic);
        self.cursors.retain(|(t, _), _| t != topic);
        self.store.clear_topic(topic)?;
        debug!(topic = %topic, "Topic cleared");
        Ok(())
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    /// Get all topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.key().clone()).collect()
    }

    fn get_or_create_topic(&self, topic: &str) -> Result<Arc<Topic>, BrokerError> {
        if let Some(queue) = self.topics.get(topic) {
            return Ok(queue.clone());
        }
        if self.topics.len() >= self.config.max_topics {
            return Err(BrokerError::MaxTopicsReached);
        }
        let queue = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| {
                debug!(topic = %topic, "Creating topic");
                Arc::new(Topic::new(topic))
            })
            .clone();
        Ok(queue)
    }

    fn cursor(&self, topic: &str, group: &str) -> CursorRef {
        self.cursors
            .entry((topic.to_string(), group.to_string()))
            .or_insert_with(|| {
                let delivered = self.store.load_cursor(topic, group).unwrap_or_else(|e| {
                    warn!(topic = %topic, group = %group, error = %e, "Cursor load failed, starting empty");
                    HashSet::new()
                });
                debug!(topic = %topic, group = %group, delivered = delivered.len(), "Cursor created");
                Arc::new(Mutex::new(GroupCursor {
                    delivered,
                    dirty: false,
                }))
            })
            .clone()
    }

    /// Persist a cursor off the polling path.
    ///
    /// Uses a blocking task when a tokio runtime is available, otherwise
    /// writes inline. Failures leave the cursor dirty for the next poll.
    fn spawn_cursor_persist(&self, topic: &str, group: &str, cursor: CursorRef) {
        let store = self.store.clone();
        let topic = topic.to_string();
        let group = group.to_string();
        let persist = move || persist_cursor(&store, &topic, &group, &cursor);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(persist);
            }
            Err(_) => persist(),
        }
    }

    fn flush_cursors(&self) {
        for entry in self.cursors.iter() {
            let (topic, group) = entry.key();
            persist_cursor(&self.store, topic, group, entry.value());
        }
    }
}

fn persist_cursor(
    store: &DurableStore<Message>,
    topic: &str,
    group: &str,
    cursor: &Mutex<GroupCursor>,
) {
    let mut guard = cursor.lock().expect("cursor lock poisoned");
    match store.save_cursor(topic, group, &guard.delivered) {
        Ok(()) => guard.dirty = false,
        Err(e) => {
            guard.dirty = true;
            warn!(
                topic = %topic,
                group = %group,
                error = %e,
                "Cursor persistence failed, will retry on next poll"
            );
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone)]
pub struct BrokerStats {
    /// Number of topics.
    pub topic_count: usize,
    /// Total messages held across all topics.
    pub message_count: usize,
    /// Number of (topic, group) cursors.
    pub group_count: usize,
    /// Number of active consumer registrations.
    pub consumer_count: usize,
}
