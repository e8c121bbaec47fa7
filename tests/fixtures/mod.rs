// Copyright (c) 2025 - Cowboy AI, Inc.
//! Test Fixtures for cim-outbox
//!
//! Deterministic message data and a pre-wired service over the in-memory
//! database and recording bus. UUIDs are fixed constants so assertions can
//! name the exact message they expect.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cim_outbox::test_tools::{MemoryDatabase, RecordingBus};
use cim_outbox::{Message, OutboxConfig, OutboxResult, OutboxService, RetryPolicy};

// Fixed test UUIDs (UUID v7 format, but deterministic for testing)
pub const MESSAGE_ID_1: &str = "01934f4a-0001-7000-8000-000000000001";
pub const MESSAGE_ID_2: &str = "01934f4a-0002-7000-8000-000000000002";
pub const MESSAGE_ID_3: &str = "01934f4a-0003-7000-8000-000000000003";

pub const CORRELATION_ID_1: &str = "01934f4a-c001-7000-8000-00000000c001";

pub const PRODUCT_TABLE: &str = "product_outbox";
pub const ORDER_TABLE: &str = "order_outbox";

pub const PRODUCT_CREATED: &str = "product.created";
pub const PRODUCT_UPDATED: &str = "product.updated";
pub const ORDER_PLACED: &str = "order.placed";
pub const UNMAPPED_TOPIC: &str = "invoice.issued";

pub const CONSUMER_GROUP: &str = "outbox_forwarder";

/// Parse a fixed UUID from a constant string
pub fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).expect("Invalid UUID in test fixture")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCreated {
    pub sku: String,
    pub name: String,
}

pub fn product_created_fixture() -> ProductCreated {
    ProductCreated {
        sku: "A-1".to_string(),
        name: "Widget".to_string(),
    }
}

/// Message with a fixed UUID and a plain-text payload
pub fn message_fixture(id: &str, payload: &'static str) -> Message {
    Message::with_uuid(parse_uuid(id), payload)
}

/// Two tables, three mapped topics; tuned for fast tests
pub fn config_fixture() -> OutboxConfig {
    OutboxConfig::new(
        [PRODUCT_TABLE, ORDER_TABLE],
        [
            (PRODUCT_CREATED, PRODUCT_TABLE),
            (PRODUCT_UPDATED, PRODUCT_TABLE),
            (ORDER_PLACED, ORDER_TABLE),
        ],
    )
    .with_poll_interval(Duration::from_millis(5))
    .with_retry(RetryPolicy {
        max_retries: 5,
        initial_interval: Duration::from_millis(1),
        multiplier: 2.0,
        max_interval: Duration::from_millis(20),
    })
}

/// A service over fresh in-memory doubles
pub struct Harness {
    pub db: MemoryDatabase,
    pub bus: Arc<RecordingBus>,
    pub service: Arc<OutboxService>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(config_fixture())
    }

    pub fn with_config(config: OutboxConfig) -> Self {
        let db = MemoryDatabase::new();
        let bus = Arc::new(RecordingBus::new());
        let service = Arc::new(
            OutboxService::new(config, Arc::new(db.clone()), bus.clone())
                .expect("Invalid fixture config"),
        );
        Self { db, bus, service }
    }

    /// Run the service in the background
    pub fn start(&self) -> (CancellationToken, JoinHandle<OutboxResult<()>>) {
        let ctx = CancellationToken::new();
        let service = self.service.clone();
        let run_ctx = ctx.clone();
        let handle = tokio::spawn(async move { service.run(run_ctx).await });
        (ctx, handle)
    }
}

/// Poll `condition` until it holds, failing the test after two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within two seconds"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
