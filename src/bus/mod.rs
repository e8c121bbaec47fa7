// Copyright (c) 2025 - Cowboy AI, Inc.
//! External Bus
//!
//! The publish/subscribe system outbox rows are forwarded to. Two
//! implementations ship with the crate:
//!
//! - [`InMemoryBus`]: in-process fan-out, for embedded use and tests
//! - [`NatsBus`]: core NATS subjects via `async-nats`
//!
//! Publishing succeeds once the bus has accepted the message; whether any
//! subscriber consumes it is outside the outbox's contract.

pub mod memory;
pub mod nats;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::message::Message;

pub use memory::InMemoryBus;
pub use nats::{NatsBus, NatsConfig};

/// Messages arriving on one subscribed topic
pub type MessageStream = BoxStream<'static, Message>;

/// Errors raised by an external bus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("Failed to publish to '{topic}': {reason}")]
    Publish { topic: String, reason: String },

    #[error("Failed to subscribe to '{topic}': {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("Bus is closed")]
    Closed,
}

/// Publish/subscribe capability the outbox forwards to
#[async_trait]
pub trait Bus: Send + Sync {
    /// Hand `message` to the bus under `topic`
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError>;

    /// Stream of messages published to `topic` from now on
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError>;

    /// Stop accepting publishes and end open subscription streams
    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}
