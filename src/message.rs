// Copyright (c) 2025 - Cowboy AI, Inc.
//! Messages and outbox rows
//!
//! A [`Message`] is the in-flight unit handed to handlers. An
//! [`OutboxMessage`] is a row read back from an outbox table; it carries the
//! [`OrderingToken`] the poller uses to sequence delivery and advance offsets.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::OutboxResult;

/// Metadata key carrying the logical topic a row was published to
pub const DESTINATION_TOPIC_KEY: &str = "destination_topic";

/// Metadata key carrying the correlation identifier
pub const CORRELATION_ID_KEY: &str = "correlation_id";

/// Ordered string metadata attached to every message
pub type Metadata = BTreeMap<String, String>;

/// In-flight message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub uuid: Uuid,
    pub payload: Bytes,
    pub metadata: Metadata,
}

impl Message {
    /// Create a message with a fresh time-ordered UUID
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self::with_uuid(Uuid::now_v7(), payload)
    }

    /// Create a message with a caller-chosen UUID
    pub fn with_uuid(uuid: Uuid, payload: impl Into<Bytes>) -> Self {
        Self {
            uuid,
            payload: payload.into(),
            metadata: Metadata::new(),
        }
    }

    /// Serialize `payload` as JSON into a new message
    pub fn from_json<T: Serialize>(payload: &T) -> OutboxResult<Self> {
        Ok(Self::new(serde_json::to_vec(payload)?))
    }

    /// Deserialize the JSON payload
    pub fn decode_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Builder-style metadata insert
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn destination_topic(&self) -> Option<&str> {
        self.metadata(DESTINATION_TOPIC_KEY)
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.metadata(CORRELATION_ID_KEY)
    }
}

/// Position of a row in commit-order approximation
///
/// Compared first by the writing transaction's id, then by the row's insert
/// sequence within the table. Rows written by one transaction share
/// `transaction_id` and keep their statement order through `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderingToken {
    pub transaction_id: i64,
    pub offset: i64,
}

impl OrderingToken {
    pub fn new(transaction_id: i64, offset: i64) -> Self {
        Self {
            transaction_id,
            offset,
        }
    }
}

impl fmt::Display for OrderingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.transaction_id, self.offset)
    }
}

/// Row read back from an outbox table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub uuid: Uuid,
    pub payload: Bytes,
    pub metadata: Metadata,
    pub ordering_token: OrderingToken,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Build the in-flight message delivered to the pipeline
    pub fn to_message(&self) -> Message {
        Message {
            uuid: self.uuid,
            payload: self.payload.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn ordering_token_compares_transaction_before_offset() {
        let early_tx_late_row = OrderingToken::new(10, 900);
        let late_tx_early_row = OrderingToken::new(11, 1);

        assert!(early_tx_late_row < late_tx_early_row);
        assert!(OrderingToken::new(10, 1) < OrderingToken::new(10, 2));
    }

    #[test]
    fn json_payload_round_trips_through_message() {
        let msg = Message::from_json(&json!({"sku": "A-1", "qty": 3})).unwrap();
        let value: serde_json::Value = msg.decode_json().unwrap();

        assert_eq!(value["sku"], "A-1");
        assert!(msg.destination_topic().is_none());
    }

    #[test]
    fn metadata_accessors() {
        let msg = Message::new("x")
            .with_metadata(DESTINATION_TOPIC_KEY, "product.created")
            .with_metadata(CORRELATION_ID_KEY, "c-1");

        assert_eq!(msg.destination_topic(), Some("product.created"));
        assert_eq!(msg.correlation_id(), Some("c-1"));
    }
}
