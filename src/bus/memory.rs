// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-process bus
//!
//! Fan-out over unbounded channels. A message published while a topic has no
//! subscribers is discarded, the same as a core NATS subject.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use super::{Bus, BusError, MessageStream};
use crate::message::Message;

#[derive(Debug, Default)]
pub struct InMemoryBus {
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Message>>>>,
    closed: AtomicBool,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers
            .lock()
            .map(|subs| {
                subs.get(topic)
                    .map(|senders| senders.iter().filter(|s| !s.is_closed()).count())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    fn poisoned(topic: &str) -> BusError {
        BusError::Publish {
            topic: topic.to_string(),
            reason: "subscriber registry poisoned".into(),
        }
    }
}

#[async_trait]
impl Bus for InMemoryBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let mut subscribers = self.subscribers.lock().map_err(|_| Self::poisoned(topic))?;
        if let Some(senders) = subscribers.get_mut(topic) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
            debug!(topic, receivers = senders.len(), "Delivered in-process");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| BusError::Subscribe {
                topic: topic.to_string(),
                reason: "subscriber registry poisoned".into(),
            })?
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.closed.store(true, Ordering::Release);
        if let Ok(mut subscribers) = self.subscribers.lock() {
            // Dropping the senders ends every stream
            subscribers.clear();
        }
        Ok(())
    }
}
