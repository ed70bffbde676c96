//! The durable store implementation.

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// File extension for message records.
pub const MESSAGE_EXTENSION: &str = "msg";

/// File extension for delivered-set cursor records.
pub const CURSOR_EXTENSION: &str = "cursor";

/// File name of the optional progress-count table.
pub const PROGRESS_FILE: &str = "progress";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Record serialization failure.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A record the store can persist and replay.
///
/// Implemented by the broker's message type; the identifier must be unique
/// within a topic and the timestamp drives replay ordering.
pub trait Record: Serialize + DeserializeOwned + Clone {
    /// Unique record identifier.
    fn record_id(&self) -> Uuid;

    /// Topic the record belongs to.
    fn record_topic(&self) -> &str;

    /// Creation timestamp, UTC milliseconds.
    fn record_timestamp(&self) -> u64;
}

/// On-disk log of records plus persisted consumer-group progress.
///
/// All methods use synchronous `std::fs` I/O; records are small standalone
/// JSON files. An in-memory identifier index backs duplicate rejection and
/// is rebuilt by [`DurableStore::load_all`].
#[derive(Debug)]
pub struct DurableStore<R> {
    /// Storage root directory.
    root: PathBuf,
    /// Known record identifiers per topic.
    index: DashMap<String, HashSet<Uuid>>,
    /// Serializes read-modify-write updates of the shared progress table.
    progress_lock: Mutex<()>,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R: Record> DurableStore<R> {
    /// Open a store rooted at the given directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Opened durable store");
        Ok(Self {
            root,
            index: DashMap::new(),
            progress_lock: Mutex::new(()),
            _marker: std::marker::PhantomData,
        })
    }

    /// Get the storage root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    fn message_path(&self, topic: &str, id: Uuid) -> PathBuf {
        self.topic_dir(topic)
            .join(format!("{id}.{MESSAGE_EXTENSION}"))
    }

    fn cursor_path(&self, topic: &str, group: &str) -> PathBuf {
        self.topic_dir(topic)
            .join(format!("{group}.{CURSOR_EXTENSION}"))
    }

    fn progress_path(&self) -> PathBuf {
        self.root.join(PROGRESS_FILE)
    }

    /// Persist a record.
    ///
    /// Returns `false` without writing if a record with the same identifier
    /// already exists for the topic (duplicate-publish rejection).
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be serialized or written; the
    /// identifier is not indexed in that case.
    pub fn save(&self, record: &R) -> Result<bool, StoreError> {
        let topic = record.record_topic().to_string();
        let id = record.record_id();
        let path = self.message_path(&topic, id);

        // The entry guard serializes duplicate checks per topic.
        let mut ids = self.index.entry(topic.clone()).or_default();
        if ids.contains(&id) || path.exists() {
            debug!(topic = %topic, id = %id, "Rejecting duplicate record");
            return Ok(false);
        }

        fs::create_dir_all(self.topic_dir(&topic))?;
        let data = serde_json::to_vec(record)?;
        fs::write(&path, data)?;
        ids.insert(id);

        Ok(true)
    }

    /// Replay every record on disk, rebuilding the in-memory index.
    ///
    /// Individually corrupt records are logged and skipped so one bad file
    /// cannot abort the whole recovery. Records are returned in ascending
    /// timestamp order.
    ///
    /// # Errors
    ///
    /// Returns an error only if the storage root itself cannot be scanned.
    pub fn load_all(&self) -> Result<Vec<R>, StoreError> {
        self.index.clear();
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let topic = entry.file_name().to_string_lossy().into_owned();

            for file in fs::read_dir(entry.path())? {
                let file = file?;
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(MESSAGE_EXTENSION) {
                    continue;
                }

                match read_record::<R>(&path) {
                    Ok(record) => {
                        self.index
                            .entry(topic.clone())
                            .or_default()
                            .insert(record.record_id());
                        records.push(record);
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Skipping corrupt record");
                        skipped += 1;
                    }
                }
            }
            // Topics that only hold cursor files still exist after replay.
            self.index.entry(topic).or_default();
        }

        records.sort_by_key(Record::record_timestamp);
        info!(
            records = records.len(),
            skipped, "Durable store replay complete"
        );
        Ok(records)
    }

    /// Load the persisted delivered-set for a (topic, group) pair.
    ///
    /// Returns an empty set if no cursor has been persisted yet. A corrupt
    /// cursor is logged and treated as empty, which only causes redelivery.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing cursor file cannot be read.
    pub fn load_cursor(&self, topic: &str, group: &str) -> Result<HashSet<Uuid>, StoreError> {
        let path = self.cursor_path(topic, group);
        if !path.exists() {
            return Ok(HashSet::new());
        }

        let data = fs::read(&path)?;
        match serde_json::from_slice::<Vec<Uuid>>(&data) {
            Ok(ids) => Ok(ids.into_iter().collect()),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt cursor, treating as empty");
                Ok(HashSet::new())
            }
        }
    }

    /// Overwrite the persisted delivered-set for a (topic, group) pair.
    ///
    /// Also updates the progress-count table; a failure there is logged but
    /// does not fail the cursor write, since the table is only an
    /// accelerator.
    ///
    /// # Errors
    ///
    /// Returns an error if the cursor file cannot be written.
    pub fn save_cursor(
        &self,
        topic: &str,
        group: &str,
        delivered: &HashSet<Uuid>,
    ) -> Result<(), StoreError> {
        fs::create_dir_all(self.topic_dir(topic))?;

        let mut ids: Vec<Uuid> = delivered.iter().copied().collect();
        ids.sort();
        let data = serde_json::to_vec(&ids)?;
        fs::write(self.cursor_path(topic, group), data)?;

        if let Err(e) = self.update_progress(topic, group, delivered.len() as u64) {
            warn!(topic = %topic, group = %group, error = %e, "Progress table update failed");
        }
        Ok(())
    }

    /// Load the optional progress-count table, keyed by `topic/group`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing table cannot be read or parsed.
    pub fn load_progress(&self) -> Result<HashMap<String, u64>, StoreError> {
        let path = self.progress_path();
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let data = fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn update_progress(&self, topic: &str, group: &str, count: u64) -> Result<(), StoreError> {
        let _guard = self.progress_lock.lock().expect("progress lock poisoned");
        let mut table = self.load_progress().unwrap_or_default();
        table.insert(format!("{topic}/{group}"), count);
        let data = serde_json::to_vec(&table)?;
        fs::write(self.progress_path(), data)?;
        Ok(())
    }

    /// Delete a single record.
    ///
    /// Returns `false` if no record with that identifier exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the record file cannot be removed.
    pub fn remove(&self, topic: &str, id: Uuid) -> Result<bool, StoreError> {
        let path = self.message_path(topic, id);
        if let Some(mut ids) = self.index.get_mut(topic) {
            ids.remove(&id);
        }
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a topic directory and its index entries. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing directory cannot be removed.
    pub fn clear_topic(&self, topic: &str) -> Result<(), StoreError> {
        self.index.remove(topic);
        match fs::remove_dir_all(self.topic_dir(topic)) {
            Ok(()) => {
                debug!(topic = %topic, "Cleared topic directory");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Check whether a record identifier is known for a topic.
    #[must_use]
    pub fn contains(&self, topic: &str, id: Uuid) -> bool {
        self.index
            .get(topic)
            .map(|ids| ids.contains(&id))
            .unwrap_or(false)
    }

    /// Get the indexed topic names.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.index.iter().map(|e| e.key().clone()).collect()
    }

    /// Get the number of indexed records for a topic.
    #[must_use]
    pub fn record_count(&self, topic: &str) -> usize {
        self.index.get(topic).map(|ids| ids.len()).unwrap_or(0)
    }
}

fn read_record<R: Record>(path: &Path) -> Result<R, StoreError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        id: Uuid,
        topic: String,
        timestamp: u64,
        body: String,
    }

    impl TestRecord {
        fn new(topic: &str, timestamp: u64, body: &str) -> Self {
            Self {
                id: Uuid::new_v4(),
                topic: topic.to_string(),
                timestamp,
                body: body.to_string(),
            }
        }
    }

    impl Record for TestRecord {
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

    fn open_store(dir: &tempfile::TempDir) -> DurableStore<TestRecord> {
        DurableStore::open(dir.path().join("store")).unwrap()
    }

    #[test]
    fn test_save_and_duplicate_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = TestRecord::new("orders", 1, "a");
        assert!(store.save(&record).unwrap());
        assert!(!store.save(&record).unwrap());
        assert!(store.contains("orders", record.id));
        assert_eq!(store.record_count("orders"), 1);
    }

    #[test]
    fn test_load_all_replays_in_timestamp_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let r3 = TestRecord::new("orders", 30, "c");
        let r1 = TestRecord::new("orders", 10, "a");
        let r2 = TestRecord::new("invoices", 20, "b");
        for r in [&r3, &r1, &r2] {
            store.save(r).unwrap();
        }

        let reopened: DurableStore<TestRecord> =
            DurableStore::open(dir.path().join("store")).unwrap();
        let records = reopened.load_all().unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, r1.id);
        assert_eq!(records[1].id, r2.id);
        assert_eq!(records[2].id, r3.id);
        assert!(reopened.contains("orders", r1.id));
        assert!(reopened.contains("invoices", r2.id));
    }

    #[test]
    fn test_load_all_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.save(&TestRecord::new("orders", 1, "a")).unwrap();
        store.save(&TestRecord::new("orders", 2, "b")).unwrap();

        let first = store.load_all().unwrap();
        let second = store.load_all().unwrap();
        assert_eq!(first, second);
        assert_eq!(store.record_count("orders"), 2);
    }

    #[test]
    fn test_load_all_skips_corrupt_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let good = TestRecord::new("orders", 1, "a");
        store.save(&good).unwrap();

        let bad_path = dir
            .path()
            .join("store")
            .join("orders")
            .join(format!("{}.msg", Uuid::new_v4()));
        fs::write(&bad_path, b"{not json").unwrap();

        let records = store.load_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, good.id);
    }

    #[test]
    fn test_cursor_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        assert!(store.load_cursor("orders", "analytics").unwrap().is_empty());

        let delivered: HashSet<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        store.save_cursor("orders", "analytics", &delivered).unwrap();

        let loaded = store.load_cursor("orders", "analytics").unwrap();
        assert_eq!(loaded, delivered);

        // Other groups are unaffected
        assert!(store.load_cursor("orders", "billing").unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_cursor_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.save_cursor("orders", "analytics", &HashSet::new()).unwrap();

        fs::write(
            dir.path().join("store").join("orders").join("analytics.cursor"),
            b"][",
        )
        .unwrap();

        assert!(store.load_cursor("orders", "analytics").unwrap().is_empty());
    }

    #[test]
    fn test_progress_table_tracks_cursor_saves() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let delivered: HashSet<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        store.save_cursor("orders", "analytics", &delivered).unwrap();

        let progress = store.load_progress().unwrap();
        assert_eq!(progress.get("orders/analytics"), Some(&5));
    }

    #[test]
    fn test_concurrent_cursor_saves_keep_every_progress_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let groups = ["g-0", "g-1", "g-2", "g-3"];
        std::thread::scope(|s| {
            for group in groups {
                let store = &store;
                s.spawn(move || {
                    let delivered: HashSet<Uuid> = [Uuid::new_v4()].into_iter().collect();
                    store.save_cursor("orders", group, &delivered).unwrap();
                });
            }
        });

        let progress = store.load_progress().unwrap();
        for group in groups {
            assert_eq!(progress.get(&format!("orders/{group}")), Some(&1));
        }
    }

    #[test]
    fn test_remove_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let record = TestRecord::new("outbox", 1, "a");
        store.save(&record).unwrap();
        assert!(store.remove("outbox", record.id).unwrap());
        assert!(!store.remove("outbox", record.id).unwrap());
        assert!(!store.contains("outbox", record.id));

        // Removed records are gone after replay, and the id can be reused
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.save(&record).unwrap());
    }

    #[test]
    fn test_clear_topic_removes_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        store.save(&TestRecord::new("orders", 1, "a")).unwrap();
        store
            .save_cursor("orders", "analytics", &HashSet::new())
            .unwrap();

        store.clear_topic("orders").unwrap();
        assert!(!dir.path().join("store").join("orders").exists());
        assert_eq!(store.record_count("orders"), 0);
        assert!(store.load_all().unwrap().is_empty());

        // Idempotent
        store.clear_topic("orders").unwrap();
    }
}
