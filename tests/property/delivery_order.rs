// Copyright (c) 2025 - Cowboy AI, Inc.
//! Property-Based Tests for Delivery Order
//!
//! Committed rows reach the handler in ordering-token order, and a
//! consumer's acknowledged offset never moves backwards.

use std::sync::{Arc, Mutex};

use cim_outbox::middleware::handler_fn;
use cim_outbox::router::PostgresDialect;
use cim_outbox::test_tools::MemoryDatabase;
use cim_outbox::{Executor, Message, OrderingToken, OutboxDialect, OutboxPoller};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::fixtures::*;

// ============================================================================
// Strategies
// ============================================================================

/// Batch sizes, one transaction each
fn transaction_sizes() -> impl Strategy<Value = Vec<usize>> {
    prop::collection::vec(1usize..8, 1..8)
}

fn ordering_token() -> impl Strategy<Value = OrderingToken> {
    (0i64..1_000, 0i64..1_000).prop_map(|(txid, offset)| OrderingToken::new(txid, offset))
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// Property: Delivery order equals commit order
    ///
    /// Sequential transactions are delivered in the order they committed,
    /// rows within one transaction in statement order. The final offset is
    /// the token of the last row.
    #[test]
    fn prop_delivery_follows_publish_order(sizes in transaction_sizes()) {
        let harness = Harness::new();
        let config = config_fixture().with_batch_size(100);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let collected = seen.clone();
        let poller = OutboxPoller::new(
            PRODUCT_CREATED,
            &config,
            harness.service.router().clone(),
            Arc::new(harness.db.clone()),
            handler_fn(move |message: Message| {
                let collected = collected.clone();
                async move {
                    collected.lock().unwrap().push(message.payload);
                    Ok(())
                }
            }),
            &Span::none(),
        )
        .unwrap();

        let mut expected = Vec::new();
        for (tx, size) in sizes.iter().enumerate() {
            let messages: Vec<Message> = (0..*size)
                .map(|i| Message::new(format!("{}-{}", tx, i)))
                .collect();
            expected.extend(messages.iter().map(|m| m.payload.clone()));
            tokio_test::block_on(harness.service.publish(PRODUCT_CREATED, messages)).unwrap();
        }

        let report = tokio_test::block_on(async {
            poller.subscribe_initialize().await?;
            poller.poll_once(&CancellationToken::new()).await
        })
        .unwrap();

        prop_assert_eq!(report.acknowledged, expected.len());
        prop_assert_eq!(&*seen.lock().unwrap(), &expected);

        let last = harness.db.rows(PRODUCT_TABLE).last().map(|r| r.ordering_token);
        prop_assert_eq!(
            harness.db.offset(PRODUCT_TABLE, CONSUMER_GROUP, PRODUCT_CREATED),
            last
        );
    }

    /// Property: Offsets are monotonic
    ///
    /// After any sequence of advances the stored offset is the largest
    /// token seen, never a later but smaller one.
    #[test]
    fn prop_offset_never_moves_backwards(tokens in prop::collection::vec(ordering_token(), 1..30)) {
        let db = MemoryDatabase::new();
        let dialect = PostgresDialect;

        tokio_test::block_on(async {
            for statement in dialect.build_initialize(ORDER_TABLE, CONSUMER_GROUP, ORDER_PLACED) {
                db.execute(&statement).await.unwrap();
            }
            for token in &tokens {
                let advance = dialect.build_offset_advance(
                    ORDER_TABLE,
                    CONSUMER_GROUP,
                    ORDER_PLACED,
                    *token,
                );
                db.execute(&advance).await.unwrap();
            }
        });

        let max = tokens.iter().copied().max().unwrap_or_default();
        prop_assert_eq!(db.offset(ORDER_TABLE, CONSUMER_GROUP, ORDER_PLACED), Some(max));
    }
}
