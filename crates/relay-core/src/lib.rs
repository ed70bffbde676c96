//! # relay-core
//!
//! Topic queues, consumer-group cursors, and the broker core for Relay.
//!
//! This crate provides the in-memory half of the broker:
//!
//! - **Message** - Immutable message value type
//! - **Topic** - Append-only, time-ordered message queue
//! - **ConsumerRegistry** - Ephemeral consumer registrations
//! - **Broker** - Publish/poll engine with per-(topic, group) delivery cursors
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Producer   │────▶│   Broker    │────▶│   Topic     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │
//!                            ▼
//!                     ┌─────────────┐
//!                     │ DurableStore│
//!                     └─────────────┘
//! ```
//!
//! Every publish is persisted through [`relay_store::DurableStore`] before it
//! is admitted to a topic queue; every consumer group keeps an independent
//! delivered-set cursor that is persisted after each non-empty poll.

pub mod broker;
pub mod message;
pub mod registry;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerError, BrokerStats};
pub use message::{Message, MessageId};
pub use registry::{ConsumerRegistry, Registration};
pub use topic::{Topic, TopicName};
