//! Consumer-side polling runner.
//!
//! Pluggable consumer behavior is a [`MessageHandler`] registered in an
//! explicit [`HandlerRegistry`] at startup. The [`ConsumerRunner`] drives
//! one polling loop per registration, dispatching messages into a
//! semaphore-bounded worker pool, and shuts down cooperatively: in-flight
//! handling finishes, no new work is admitted.

use crate::client::{BrokerClient, ClientError};
use async_trait::async_trait;
use relay_core::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A handler invoked for every delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message.
    ///
    /// # Errors
    ///
    /// Handler failures are logged by the runner; the message is not
    /// redelivered within this process (the broker cursor has already
    /// advanced).
    async fn handle(
        &self,
        message: Message,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A (topic, group) handler registration.
struct HandlerEntry {
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
}

/// Explicit startup-time registry of message handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a (topic, group) pair.
    pub fn register(
        &mut self,
        topic: impl Into<String>,
        group: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.entries.push(HandlerEntry {
            topic: topic.into(),
            group: group.into(),
            handler,
        });
    }

    /// Get the number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum messages one group processes in parallel.
    pub concurrency: usize,
    /// Delay between polls.
    pub poll_interval: Duration,
    /// Per-call timeout for a single poll.
    pub request_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(250),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Drives polling loops for every registered handler.
pub struct ConsumerRunner<C> {
    client: Arc<C>,
    config: ConsumerConfig,
}

impl<C: BrokerClient + 'static> ConsumerRunner<C> {
    /// Create a new runner.
    #[must_use]
    pub fn new(client: Arc<C>, config: ConsumerConfig) -> Self {
        Self { client, config }
    }

    /// Spawn one polling loop per registration and return a shutdown handle.
    #[must_use]
    pub fn run(&self, registry: HandlerRegistry) -> RunnerHandle {
        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(registry.entries.len());

        for entry in registry.entries {
            let client = self.client.clone();
            let config = self.config.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            tasks.push(tokio::spawn(poll_loop(client, entry, config, shutdown_rx)));
        }

        info!(loops = tasks.len(), "Consumer runner started");
        RunnerHandle { shutdown_tx, tasks }
    }
}

/// Handle for stopping a running consumer runner.
pub struct RunnerHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Signal shutdown and wait for every loop to drain its in-flight work.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Consumer runner stopped");
    }
}

async fn poll_loop<C: BrokerClient>(
    client: Arc<C>,
    entry: HandlerEntry,
    config: ConsumerConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    // Zero permits would wedge the pool on the first message.
    let permits = config.concurrency.max(1);
    let semaphore = Arc::new(Semaphore::new(permits));
    debug!(topic = %entry.topic, group = %entry.group, "Polling loop started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender counts as shutdown too.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            () = tokio::time::sleep(config.poll_interval) => {
                let batch = match timeout(
                    config.request_timeout,
                    client.poll(&entry.topic, &entry.group),
                )
                .await
                {
                    Ok(Ok(batch)) => batch,
                    Ok(Err(e)) => {
                        warn!(topic = %entry.topic, group = %entry.group, error = %e, "Poll failed");
                        continue;
                    }
                    Err(_) => {
                        warn!(topic = %entry.topic, group = %entry.group, "Poll timed out");
                        continue;
                    }
                };

                for message in batch {
                    // Admission control: at most `concurrency` messages of
                    // this group in flight at once.
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore closed");
                    let handler = entry.handler.clone();
                    let topic = entry.topic.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handler.handle(message).await {
                            warn!(topic = %topic, error = %e, "Handler failed");
                        }
                        drop(permit);
                    });
                }
            }
        }
    }

    // Drain: wait until every in-flight handler returned its permit.
    let _ = semaphore
        .acquire_many(permits as u32)
        .await
        .expect("semaphore closed");
    debug!(topic = %entry.topic, group = %entry.group, "Polling loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DirectClient;
    use relay_core::Broker;
    use relay_store::DurableStore;
    use std::sync::Mutex;

    struct Collector {
        received: Mutex<Vec<Message>>,
    }

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn handle(
            &self,
            message: Message,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.received.lock().unwrap().push(message);
            Ok(())
        }
    }

    fn fast_config() -> ConsumerConfig {
        ConsumerConfig {
            concurrency: 2,
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(1),
        }
    }

    async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = tokio::time::Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn test_runner_delivers_to_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path().join("data")).unwrap());
        let broker = Arc::new(Broker::new(store));
        broker.start().unwrap();
        let client = Arc::new(DirectClient::new(broker.clone()));

        let analytics = Collector::new();
        let billing = Collector::new();
        let mut registry = HandlerRegistry::new();
        registry.register("orders", "analytics", analytics.clone());
        registry.register("orders", "billing", billing.clone());
        assert_eq!(registry.len(), 2);

        let runner = ConsumerRunner::new(client, fast_config());
        let handle = runner.run(registry);

        for body in [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()] {
            broker.publish("orders", Message::new("orders", body)).unwrap();
        }

        // Both groups independently see the full stream.
        assert!(
            wait_until(Duration::from_secs(5), || {
                analytics.count() == 3 && billing.count() == 3
            })
            .await
        );

        handle.shutdown().await;

        // No new work is admitted after shutdown.
        broker.publish("orders", Message::new("orders", b"d".to_vec())).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(analytics.count(), 3);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_treated_as_one() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path().join("data")).unwrap());
        let broker = Arc::new(Broker::new(store));
        broker.start().unwrap();
        let client = Arc::new(DirectClient::new(broker.clone()));

        let collector = Collector::new();
        let mut registry = HandlerRegistry::new();
        registry.register("orders", "analytics", collector.clone());

        let config = ConsumerConfig {
            concurrency: 0,
            poll_interval: Duration::from_millis(10),
            request_timeout: Duration::from_secs(1),
        };
        let handle = ConsumerRunner::new(client, config).run(registry);

        broker.publish("orders", Message::new("orders", b"x".to_vec())).unwrap();
        assert!(wait_until(Duration::from_secs(5), || collector.count() == 1).await);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_with_no_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DurableStore::open(dir.path().join("data")).unwrap());
        let broker = Arc::new(Broker::new(store));
        broker.start().unwrap();
        let client = Arc::new(DirectClient::new(broker));

        let runner = ConsumerRunner::new(client, fast_config());
        let handle = runner.run(HandlerRegistry::new());
        handle.shutdown().await;
    }
}
