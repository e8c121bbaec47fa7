// Copyright (c) 2025 - Cowboy AI, Inc.
//! Database Executor Abstraction
//!
//! The outbox never owns the business schema or its transactions. It only
//! needs something that can run a parameterized [`Statement`], either on a
//! plain connection pool or inside a transaction the caller manages:
//!
//! ```text
//! ┌──────────────┐   Statement    ┌──────────────┐
//! │ OutboxDialect│ ─────────────▶ │   Executor   │ ── pool / transaction
//! └──────────────┘                └──────────────┘
//!        ▲                               │
//!        └──────────── Row ◀─────────────┘
//! ```
//!
//! [`postgres`] implements the executors on top of `sqlx`.

pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::errors::{DatabaseError, DatabaseResult};

pub use postgres::{PostgresDatabase, PostgresTransaction};

/// Bind parameter or decoded column value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    BigInt(i64),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Json(serde_json::Value),
    Timestamp(DateTime<Utc>),
}

/// What an outbox statement does, independent of its SQL text
///
/// Executors may use it for logging; the test executor uses it to emulate
/// the storage engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Caller-supplied SQL
    Raw,
    AcquireSchemaLock { table: String },
    CreateMessagesTable { table: String },
    CreateOffsetsTable { table: String },
    RegisterConsumer { table: String },
    Insert { table: String, rows: usize },
    SelectUnconsumed { table: String },
    AdvanceOffset { table: String },
}

/// Parameterized SQL statement
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub args: Vec<SqlValue>,
    pub operation: Operation,
}

impl Statement {
    pub fn new(sql: impl Into<String>, operation: Operation) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
            operation,
        }
    }

    /// Caller-supplied SQL, e.g. a business write sharing the outbox transaction
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Operation::Raw)
    }

    pub fn bind(mut self, value: impl Into<SqlValue>) -> Self {
        self.args.push(value.into());
        self
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<serde_json::Value> for SqlValue {
    fn from(v: serde_json::Value) -> Self {
        SqlValue::Json(v)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(v: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(v)
    }
}

/// Result row with named columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, column: impl Into<String>, value: SqlValue) {
        self.columns.push(column.into());
        self.values.push(value);
    }

    pub fn with(mut self, column: impl Into<String>, value: impl Into<SqlValue>) -> Self {
        self.push(column, value.into());
        self
    }

    pub fn get(&self, column: &str) -> DatabaseResult<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
            .ok_or_else(|| DatabaseError::Decode(format!("missing column '{}'", column)))
    }

    pub fn get_i64(&self, column: &str) -> DatabaseResult<i64> {
        match self.get(column)? {
            SqlValue::BigInt(v) => Ok(*v),
            other => Err(unexpected(column, "BIGINT", other)),
        }
    }

    pub fn get_uuid(&self, column: &str) -> DatabaseResult<Uuid> {
        match self.get(column)? {
            SqlValue::Uuid(v) => Ok(*v),
            other => Err(unexpected(column, "UUID", other)),
        }
    }

    /// Bytes column; NULL decodes as empty
    pub fn get_bytes(&self, column: &str) -> DatabaseResult<Vec<u8>> {
        match self.get(column)? {
            SqlValue::Bytes(v) => Ok(v.clone()),
            SqlValue::Null => Ok(Vec::new()),
            other => Err(unexpected(column, "BYTEA", other)),
        }
    }

    /// JSON column; NULL decodes as `Value::Null`
    pub fn get_json(&self, column: &str) -> DatabaseResult<serde_json::Value> {
        match self.get(column)? {
            SqlValue::Json(v) => Ok(v.clone()),
            SqlValue::Null => Ok(serde_json::Value::Null),
            other => Err(unexpected(column, "JSON", other)),
        }
    }

    pub fn get_timestamp(&self, column: &str) -> DatabaseResult<DateTime<Utc>> {
        match self.get(column)? {
            SqlValue::Timestamp(v) => Ok(*v),
            other => Err(unexpected(column, "TIMESTAMPTZ", other)),
        }
    }
}

fn unexpected(column: &str, expected: &str, got: &SqlValue) -> DatabaseError {
    DatabaseError::Decode(format!(
        "column '{}' expected {}, got {:?}",
        column, expected, got
    ))
}

/// Runs statements on a connection or inside a transaction
#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a statement and return the number of affected rows
    async fn execute(&self, statement: &Statement) -> DatabaseResult<u64>;

    /// Run a query and return every row
    async fn fetch_all(&self, statement: &Statement) -> DatabaseResult<Vec<Row>>;
}

/// Connection pool that can open transactions
#[async_trait]
pub trait Database: Executor {
    async fn begin(&self) -> DatabaseResult<Box<dyn Transaction>>;
}

/// Caller-managed transaction
///
/// Dropping a transaction without committing rolls it back.
#[async_trait]
pub trait Transaction: Executor {
    async fn commit(self: Box<Self>) -> DatabaseResult<()>;
    async fn rollback(self: Box<Self>) -> DatabaseResult<()>;
}
