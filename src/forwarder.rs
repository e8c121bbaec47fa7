// Copyright (c) 2025 - Cowboy AI, Inc.
//! Forwarding Handler
//!
//! The handler behind every auto-wired outbox subscription. It republishes a
//! row to the external bus under the topic recorded in its
//! `destination_topic` metadata.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, Instrument, Span};

use crate::bus::Bus;
use crate::errors::DeliveryResult;
use crate::message::Message;
use crate::middleware::MessageHandler;

pub struct ForwardingHandler {
    bus: Arc<dyn Bus>,
    span: Span,
}

impl ForwardingHandler {
    pub fn new(bus: Arc<dyn Bus>, span: Span) -> Self {
        Self { bus, span }
    }
}

#[async_trait]
impl MessageHandler for ForwardingHandler {
    async fn handle(&self, message: Message) -> DeliveryResult {
        let Some(topic) = message.destination_topic().map(str::to_string) else {
            // Acked on purpose: a row without a destination can never succeed
            error!(
                parent: &self.span,
                message_uuid = %message.uuid,
                "Dropping outbox message without destination_topic"
            );
            return Ok(());
        };

        let uuid = message.uuid;
        self.bus
            .publish(&topic, message)
            .instrument(self.span.clone())
            .await?;

        debug!(parent: &self.span, topic = %topic, message_uuid = %uuid, "Forwarded to bus");
        Ok(())
    }
}
