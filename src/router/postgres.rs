// Copyright (c) 2025 - Cowboy AI, Inc.
//! Postgres outbox dialect
//!
//! Ordering tokens are `(transaction_id, offset)`. `transaction_id` comes
//! from `pg_current_xact_id()`, so every row written by one transaction
//! shares it, and `offset` is a `BIGSERIAL` keeping statement order inside
//! the transaction.
//!
//! A transaction id is assigned at a transaction's first write, not at
//! commit, so token order approximates commit order. Rows are only handed
//! out once every older transaction has finished
//! (`transaction_id < pg_snapshot_xmin(pg_current_snapshot())`); a
//! long-running writer therefore holds back later rows instead of having
//! them skipped past. Two overlapping transactions may still be delivered in
//! first-write order rather than commit order.
//!
//! Rows without a `destination_topic` (written by some other producer) are
//! handed to every topic sharing the table, so the handler can drop them
//! instead of leaving them stuck in front of the offset.

use serde_json::Value;
use tracing::warn;

use crate::config::StorageEngine;
use crate::database::{Operation, Row, Statement};
use crate::errors::{DatabaseResult, OutboxError, OutboxResult};
use crate::message::{Message, Metadata, OrderingToken, OutboxMessage};

use super::dialect::OutboxDialect;

/// Postgres caps a statement at 65535 bind parameters, three per row here
const MAX_INSERT_ROWS: usize = 65535 / 3;

/// Offsets table tracking consumers of `table`
pub fn offsets_table(table: &str) -> String {
    format!("{}_offsets", table)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl OutboxDialect for PostgresDialect {
    fn engine(&self) -> StorageEngine {
        StorageEngine::Postgres
    }

    fn max_batch(&self) -> usize {
        MAX_INSERT_ROWS
    }

    fn build_initialize(&self, table: &str, consumer_group: &str, topic: &str) -> Vec<Statement> {
        let offsets = offsets_table(table);
        let index_name = format!(
            "{}_topic_idx",
            table.rsplit('.').next().unwrap_or(table)
        );

        vec![
            Statement::new(
                "SELECT pg_advisory_xact_lock(hashtext($1))",
                Operation::AcquireSchemaLock {
                    table: table.to_string(),
                },
            )
            .bind(table),
            Statement::new(
                format!(
                    r#"CREATE TABLE IF NOT EXISTS {table} (
    "offset" BIGSERIAL,
    "uuid" UUID NOT NULL,
    "created_at" TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
    "payload" BYTEA,
    "metadata" JSONB,
    "transaction_id" XID8 NOT NULL,
    PRIMARY KEY ("transaction_id", "offset")
)"#
                ),
                Operation::CreateMessagesTable {
                    table: table.to_string(),
                },
            ),
            Statement::new(
                format!(
                    r#"CREATE INDEX IF NOT EXISTS {index_name} ON {table} (("metadata"->>'destination_topic'), "transaction_id", "offset")"#
                ),
                Operation::CreateMessagesTable {
                    table: table.to_string(),
                },
            ),
            Statement::new(
                format!(
                    r#"CREATE TABLE IF NOT EXISTS {offsets} (
    consumer_group TEXT NOT NULL,
    topic TEXT NOT NULL,
    offset_acked BIGINT NOT NULL DEFAULT 0,
    last_processed_transaction_id XID8 NOT NULL DEFAULT '0',
    PRIMARY KEY (consumer_group, topic)
)"#
                ),
                Operation::CreateOffsetsTable {
                    table: table.to_string(),
                },
            ),
            Statement::new(
                format!(
                    "INSERT INTO {offsets} (consumer_group, topic, offset_acked, last_processed_transaction_id) \
                     VALUES ($1, $2, 0, '0') ON CONFLICT (consumer_group, topic) DO NOTHING"
                ),
                Operation::RegisterConsumer {
                    table: table.to_string(),
                },
            )
            .bind(consumer_group)
            .bind(topic),
        ]
    }

    fn build_insert(&self, table: &str, messages: &[Message]) -> OutboxResult<Statement> {
        if messages.len() > MAX_INSERT_ROWS {
            return Err(OutboxError::BatchTooLarge {
                count: messages.len(),
                limit: MAX_INSERT_ROWS,
            });
        }

        let markers = (0..messages.len())
            .map(|i| {
                let n = i * 3;
                format!("(${},${},${},pg_current_xact_id())", n + 1, n + 2, n + 3)
            })
            .collect::<Vec<_>>()
            .join(",");

        let mut statement = Statement::new(
            format!(
                r#"INSERT INTO {table} ("uuid", "payload", "metadata", "transaction_id") VALUES {markers}"#
            ),
            Operation::Insert {
                table: table.to_string(),
                rows: messages.len(),
            },
        );
        for msg in messages {
            statement = statement
                .bind(msg.uuid)
                .bind(msg.payload.to_vec())
                .bind(serde_json::to_value(&msg.metadata)?);
        }
        Ok(statement)
    }

    fn build_select_unconsumed(
        &self,
        table: &str,
        consumer_group: &str,
        topic: &str,
        limit: u32,
    ) -> Statement {
        let offsets = offsets_table(table);
        Statement::new(
            format!(
                r#"WITH acked AS (
    SELECT offset_acked, last_processed_transaction_id
    FROM {offsets}
    WHERE consumer_group = $1 AND topic = $2
)
SELECT m."offset", m."uuid", m."payload", m."metadata",
       m."transaction_id"::text::bigint AS "transaction_id", m."created_at"
FROM {table} m, acked a
WHERE (m."metadata"->>'destination_topic' = $2 OR m."metadata"->>'destination_topic' IS NULL)
  AND ((m."transaction_id" = a.last_processed_transaction_id AND m."offset" > a.offset_acked)
       OR m."transaction_id" > a.last_processed_transaction_id)
  AND m."transaction_id" < pg_snapshot_xmin(pg_current_snapshot())
ORDER BY m."transaction_id" ASC, m."offset" ASC
LIMIT $3"#
            ),
            Operation::SelectUnconsumed {
                table: table.to_string(),
            },
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(i64::from(limit))
    }

    fn build_offset_advance(
        &self,
        table: &str,
        consumer_group: &str,
        topic: &str,
        token: OrderingToken,
    ) -> Statement {
        let offsets = offsets_table(table);
        Statement::new(
            format!(
                r#"INSERT INTO {offsets} AS o (consumer_group, topic, offset_acked, last_processed_transaction_id)
VALUES ($1, $2, $3, $4::bigint::text::xid8)
ON CONFLICT (consumer_group, topic) DO UPDATE
SET offset_acked = EXCLUDED.offset_acked,
    last_processed_transaction_id = EXCLUDED.last_processed_transaction_id
WHERE (o.last_processed_transaction_id, o.offset_acked)
    < (EXCLUDED.last_processed_transaction_id, EXCLUDED.offset_acked)"#
            ),
            Operation::AdvanceOffset {
                table: table.to_string(),
            },
        )
        .bind(consumer_group)
        .bind(topic)
        .bind(token.offset)
        .bind(token.transaction_id)
    }

    fn decode_token(&self, row: &Row) -> DatabaseResult<OrderingToken> {
        Ok(OrderingToken::new(
            row.get_i64("transaction_id")?,
            row.get_i64("offset")?,
        ))
    }

    fn decode_row(&self, row: &Row) -> DatabaseResult<OutboxMessage> {
        Ok(OutboxMessage {
            uuid: row.get_uuid("uuid")?,
            payload: row.get_bytes("payload")?.into(),
            metadata: decode_metadata(row.get_json("metadata")?),
            ordering_token: self.decode_token(row)?,
            created_at: row.get_timestamp("created_at")?,
        })
    }
}

/// Metadata written by other producers may hold non-string values, or not
/// be an object at all; the latter decodes as empty and so has no
/// destination
fn decode_metadata(value: Value) -> Metadata {
    match value {
        Value::Null => Metadata::new(),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
        other => {
            warn!(metadata = %other, "Ignoring outbox metadata that is not a JSON object");
            Metadata::new()
        }
    }
}
