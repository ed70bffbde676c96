//! # relay-client
//!
//! Client-side building blocks for the Relay broker:
//!
//! - **BrokerClient** - The fixed call contract a broker host exposes
//! - **ProducerQueue** - Store-and-forward publishing that survives producer
//!   restarts and transient broker outages
//! - **ConsumerRunner** - Bounded worker pool that polls on behalf of
//!   registered message handlers
//!
//! The [`BrokerClient`] trait is the seam between this crate and whatever
//! transport carries requests to the broker; [`DirectClient`] implements it
//! for an in-process broker.

pub mod client;
pub mod consumer;
pub mod producer;

pub use client::{BrokerClient, ClientError, DirectClient};
pub use consumer::{ConsumerConfig, ConsumerRunner, HandlerRegistry, MessageHandler, RunnerHandle};
pub use producer::{ProducerQueue, RetryPolicy};
