//! # relay-store
//!
//! On-disk persistence for the Relay broker: the message log and the
//! per-(topic, group) delivery cursors.
//!
//! The store is the single source of truth for recovery. The on-disk layout
//! is one directory per topic:
//!
//! ```text
//! <root>/<topic>/<message-id>.msg     one JSON record per message
//! <root>/<topic>/<group>.cursor       delivered-set record per group
//! <root>/progress                     optional progress-count table
//! ```
//!
//! Records are small standalone JSON files: a single corrupt record is
//! skipped (and logged) during replay instead of aborting recovery.
//!
//! The store is generic over the persisted record type via the [`Record`]
//! trait so the broker's message log and a producer's local
//! store-and-forward queue share the same implementation.

pub mod store;

pub use store::{DurableStore, Record, StoreError};
