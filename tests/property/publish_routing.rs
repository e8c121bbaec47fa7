// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Publish Routing
//!
//! Whatever the batch, a publish writes exactly its messages to the table
//! mapped to the topic and touches nothing else.

use cim_outbox::message::DESTINATION_TOPIC_KEY;
use cim_outbox::{Message, OutboxError};
use proptest::prelude::*;

use crate::fixtures::*;

// ============================================================================
// Strategies
// ============================================================================

fn payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

fn batch() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(payload(), 1..40)
}

fn mapped_topic() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just(PRODUCT_CREATED), Just(PRODUCT_UPDATED), Just(ORDER_PLACED)]
}

/// Topics that never appear in the fixture's routing table
fn unmapped_topic() -> impl Strategy<Value = String> {
    "[a-z]{1,12}\\.[a-z]{1,12}".prop_filter("must be unmapped", |t| {
        t != PRODUCT_CREATED && t != PRODUCT_UPDATED && t != ORDER_PLACED
    })
}

fn table_of(topic: &str) -> &'static str {
    if topic == ORDER_PLACED {
        ORDER_TABLE
    } else {
        PRODUCT_TABLE
    }
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: n messages published give n rows in the mapped table
    ///
    /// Rows keep the publish order and carry the topic as their destination.
    #[test]
    fn prop_publish_lands_in_mapped_table(topic in mapped_topic(), payloads in batch()) {
        let harness = Harness::new();
        let messages: Vec<Message> = payloads.iter().cloned().map(Message::new).collect();

        tokio_test::block_on(harness.service.publish(topic, messages.clone())).unwrap();

        let table = table_of(topic);
        let other = if table == ORDER_TABLE { PRODUCT_TABLE } else { ORDER_TABLE };
        let rows = harness.db.rows(table);

        prop_assert_eq!(rows.len(), payloads.len());
        prop_assert!(harness.db.rows(other).is_empty(), "Other table must stay empty");
        for (row, sent) in rows.iter().zip(&messages) {
            prop_assert_eq!(row.uuid, sent.uuid);
            prop_assert_eq!(&row.payload, &sent.payload);
            prop_assert_eq!(row.metadata.get(DESTINATION_TOPIC_KEY).map(String::as_str), Some(topic));
        }
    }

    /// Property: Unmapped topics are rejected before any SQL runs
    #[test]
    fn prop_unmapped_topic_writes_nothing(topic in unmapped_topic(), payloads in batch()) {
        let harness = Harness::new();
        let messages: Vec<Message> = payloads.into_iter().map(Message::new).collect();

        let result = tokio_test::block_on(harness.service.publish(&topic, messages));

        prop_assert!(
            matches!(result, Err(OutboxError::UnroutedTopic(ref t)) if *t == topic),
            "Expected UnroutedTopic, got {:?}",
            result
        );
        prop_assert_eq!(harness.db.statement_count(), 0);
    }

    /// Property: Repeated publishes accumulate without loss
    #[test]
    fn prop_publishes_accumulate(batches in prop::collection::vec(batch(), 1..6)) {
        let harness = Harness::new();
        let expected: usize = batches.iter().map(Vec::len).sum();

        for payloads in batches {
            let messages = payloads.into_iter().map(Message::new).collect();
            tokio_test::block_on(harness.service.publish(ORDER_PLACED, messages)).unwrap();
        }

        let rows = harness.db.rows(ORDER_TABLE);
        prop_assert_eq!(rows.len(), expected);
        prop_assert!(
            rows.windows(2).all(|w| w[0].ordering_token < w[1].ordering_token),
            "Ordering tokens must be strictly increasing"
        );
    }
}
