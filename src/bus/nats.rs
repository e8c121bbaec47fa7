// Copyright (c) 2025 - Cowboy AI, Inc.
//! NATS bus
//!
//! Topics map one-to-one onto NATS subjects. The message UUID and metadata
//! travel as headers so a subscriber rebuilds the same [`Message`]:
//!
//! ```text
//! Outbox-Uuid:     0192f0c1-...
//! Outbox-Metadata: {"correlation_id":"...","destination_topic":"order.placed"}
//! ```

use std::time::Duration;

use async_nats::{Client, ConnectOptions, HeaderMap};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Bus, BusError, MessageStream};
use crate::errors::{OutboxError, OutboxResult};
use crate::message::{Message, Metadata};

pub const UUID_HEADER: &str = "Outbox-Uuid";
pub const METADATA_HEADER: &str = "Outbox-Metadata";

/// Configuration for NATS connection
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs
    pub servers: Vec<String>,
    /// Client name
    pub name: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            servers: vec!["nats://localhost:4222".to_string()],
            name: "cim-outbox".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
        }
    }
}

impl NatsConfig {
    /// Single-server config for `url`
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            servers: vec![url.into()],
            ..Self::default()
        }
    }
}

/// [`Bus`] over core NATS
#[derive(Clone)]
pub struct NatsBus {
    client: Client,
}

impl NatsBus {
    pub async fn connect(config: NatsConfig) -> OutboxResult<Self> {
        let connect_options = ConnectOptions::new()
            .name(&config.name)
            .connection_timeout(config.connect_timeout)
            .request_timeout(Some(config.request_timeout));

        let client = async_nats::connect_with_options(config.servers.join(","), connect_options)
            .await
            .map_err(|e| OutboxError::Configuration(format!("NATS connection failed: {}", e)))?;

        info!("Connected to NATS at {:?}", config.servers);

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    /// Get the underlying NATS client for advanced operations
    pub fn inner(&self) -> &Client {
        &self.client
    }
}

fn encode_headers(message: &Message) -> Result<HeaderMap, serde_json::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(UUID_HEADER, message.uuid.to_string().as_str());
    headers.insert(
        METADATA_HEADER,
        serde_json::to_string(&message.metadata)?.as_str(),
    );
    Ok(headers)
}

fn decode_message(msg: async_nats::Message) -> Message {
    decode_parts(&msg.subject, msg.headers.as_ref(), msg.payload)
}

/// Rebuild a [`Message`]; foreign publishers without outbox headers get a
/// fresh UUID and empty metadata
fn decode_parts(subject: &str, headers: Option<&HeaderMap>, payload: Bytes) -> Message {
    let uuid = headers
        .and_then(|h| h.get(UUID_HEADER))
        .and_then(|v| Uuid::parse_str(v.as_str()).ok())
        .unwrap_or_else(Uuid::now_v7);
    let metadata = headers
        .and_then(|h| h.get(METADATA_HEADER))
        .and_then(|v| match serde_json::from_str::<Metadata>(v.as_str()) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(subject, error = %e, "Ignoring malformed metadata header");
                None
            }
        })
        .unwrap_or_default();

    Message {
        uuid,
        payload,
        metadata,
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        let failed = |reason: String| BusError::Publish {
            topic: topic.to_string(),
            reason,
        };

        let headers = encode_headers(&message).map_err(|e| failed(e.to_string()))?;
        self.client
            .publish_with_headers(topic.to_string(), headers, message.payload)
            .await
            .map_err(|e| failed(e.to_string()))?;
        // Surface connection failures now rather than on a later publish
        self.client
            .flush()
            .await
            .map_err(|e| failed(e.to_string()))?;

        debug!("Published message to subject: {}", topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError> {
        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        info!("Subscribed to subject: {}", topic);
        Ok(subscriber.map(decode_message).boxed())
    }

    async fn close(&self) -> Result<(), BusError> {
        self.client.flush().await.map_err(|_| BusError::Closed)
    }
}
