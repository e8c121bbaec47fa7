// Copyright (c) 2025 - Cowboy AI, Inc.
//! Per-engine statement builders

use std::fmt;
use std::sync::Arc;

use crate::config::StorageEngine;
use crate::database::{Row, Statement};
use crate::errors::{DatabaseResult, OutboxResult};
use crate::message::{Message, OrderingToken, OutboxMessage};

use super::postgres::PostgresDialect;

/// SQL capability set one storage engine provides to the outbox
///
/// Callers resolve the physical table first; dialects never choose a table.
pub trait OutboxDialect: Send + Sync + fmt::Debug {
    fn engine(&self) -> StorageEngine;

    /// Largest number of messages a single insert statement may carry
    fn max_batch(&self) -> usize;

    /// Statements creating the messages and offsets tables and registering
    /// `consumer_group` for `topic`
    ///
    /// Run them in one transaction; the first statement serializes
    /// concurrent initializers.
    fn build_initialize(&self, table: &str, consumer_group: &str, topic: &str) -> Vec<Statement>;

    /// One multi-row insert; ordering tokens come from the database
    fn build_insert(&self, table: &str, messages: &[Message]) -> OutboxResult<Statement>;

    /// Rows of `topic` after the consumer's offset, ascending by ordering token
    fn build_select_unconsumed(
        &self,
        table: &str,
        consumer_group: &str,
        topic: &str,
        limit: u32,
    ) -> Statement;

    /// Move the consumer's offset forward to `token`; never backwards
    fn build_offset_advance(
        &self,
        table: &str,
        consumer_group: &str,
        topic: &str,
        token: OrderingToken,
    ) -> Statement;

    /// Ordering token of a selected row, readable even when the rest of the
    /// row is not
    fn decode_token(&self, row: &Row) -> DatabaseResult<OrderingToken>;

    /// Decode a row produced by [`OutboxDialect::build_select_unconsumed`]
    fn decode_row(&self, row: &Row) -> DatabaseResult<OutboxMessage>;
}

impl StorageEngine {
    /// Dialect implementing this engine
    pub fn dialect(self) -> Arc<dyn OutboxDialect> {
        match self {
            StorageEngine::Postgres => Arc::new(PostgresDialect),
        }
    }
}
