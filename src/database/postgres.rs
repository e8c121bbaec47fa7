// Copyright (c) 2025 - Cowboy AI, Inc.
//! Postgres executors backed by `sqlx`
//!
//! [`PostgresDatabase`] runs statements on a pool and opens
//! [`PostgresTransaction`]s. Business code that already holds an
//! `sqlx::Transaction` can wrap it with [`PostgresTransaction::from`] to
//! write outbox rows into the same unit of work, then unwrap it again with
//! [`PostgresTransaction::into_inner`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgPool, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Column, Postgres, Row as _, TypeInfo};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{Database, Executor, Row, SqlValue, Statement, Transaction};
use crate::errors::{DatabaseError, DatabaseResult};

/// Postgres connection pool
#[derive(Debug, Clone)]
pub struct PostgresDatabase {
    pool: PgPool,
}

impl PostgresDatabase {
    /// Connect a pool to the given database URL
    pub async fn connect(url: &str, max_connections: u32) -> DatabaseResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Executor for PostgresDatabase {
    async fn execute(&self, statement: &Statement) -> DatabaseResult<u64> {
        debug!(operation = ?statement.operation, "Executing statement");
        let result = prepare(statement).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, statement: &Statement) -> DatabaseResult<Vec<Row>> {
        debug!(operation = ?statement.operation, "Running query");
        let rows = prepare(statement).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Database for PostgresDatabase {
    async fn begin(&self) -> DatabaseResult<Box<dyn Transaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTransaction::from(tx)))
    }
}

/// Open Postgres transaction
pub struct PostgresTransaction {
    inner: Mutex<Option<sqlx::Transaction<'static, Postgres>>>,
}

impl From<sqlx::Transaction<'static, Postgres>> for PostgresTransaction {
    fn from(tx: sqlx::Transaction<'static, Postgres>) -> Self {
        Self {
            inner: Mutex::new(Some(tx)),
        }
    }
}

impl PostgresTransaction {
    /// Hand the underlying `sqlx` transaction back to the caller
    pub fn into_inner(self) -> DatabaseResult<sqlx::Transaction<'static, Postgres>> {
        self.inner
            .into_inner()
            .ok_or(DatabaseError::TransactionClosed)
    }
}

#[async_trait]
impl Executor for PostgresTransaction {
    async fn execute(&self, statement: &Statement) -> DatabaseResult<u64> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(DatabaseError::TransactionClosed)?;
        debug!(operation = ?statement.operation, "Executing statement in transaction");
        let result = prepare(statement).execute(&mut **tx).await?;
        Ok(result.rows_affected())
    }

    async fn fetch_all(&self, statement: &Statement) -> DatabaseResult<Vec<Row>> {
        let mut guard = self.inner.lock().await;
        let tx = guard.as_mut().ok_or(DatabaseError::TransactionClosed)?;
        let rows = prepare(statement).fetch_all(&mut **tx).await?;
        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl Transaction for PostgresTransaction {
    async fn commit(self: Box<Self>) -> DatabaseResult<()> {
        (*self).into_inner()?.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DatabaseResult<()> {
        (*self).into_inner()?.rollback().await?;
        Ok(())
    }
}

fn prepare(statement: &Statement) -> Query<'_, Postgres, PgArguments> {
    statement
        .args
        .iter()
        .fold(sqlx::query(&statement.sql), |query, arg| match arg {
            // Untyped NULL goes over the wire as TEXT
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::BigInt(v) => query.bind(*v),
            SqlValue::Text(v) => query.bind(v.as_str()),
            SqlValue::Bytes(v) => query.bind(v.as_slice()),
            SqlValue::Uuid(v) => query.bind(*v),
            SqlValue::Json(v) => query.bind(v.clone()),
            SqlValue::Timestamp(v) => query.bind(*v),
        })
}

fn decode_row(pg_row: &PgRow) -> DatabaseResult<Row> {
    let mut row = Row::new();
    for (index, column) in pg_row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "INT8" => pg_row.try_get::<Option<i64>, _>(index)?.map(SqlValue::BigInt),
            "INT4" => pg_row
                .try_get::<Option<i32>, _>(index)?
                .map(|v| SqlValue::BigInt(v.into())),
            "TEXT" | "VARCHAR" | "NAME" => pg_row.try_get::<Option<String>, _>(index)?.map(SqlValue::Text),
            "BYTEA" => pg_row.try_get::<Option<Vec<u8>>, _>(index)?.map(SqlValue::Bytes),
            "UUID" => pg_row.try_get::<Option<Uuid>, _>(index)?.map(SqlValue::Uuid),
            "JSON" | "JSONB" => pg_row
                .try_get::<Option<serde_json::Value>, _>(index)?
                .map(SqlValue::Json),
            "TIMESTAMPTZ" => pg_row
                .try_get::<Option<DateTime<Utc>>, _>(index)?
                .map(SqlValue::Timestamp),
            other => {
                return Err(DatabaseError::Decode(format!(
                    "unsupported column type {} for '{}'",
                    other,
                    column.name()
                )))
            }
        };
        row.push(column.name(), value.unwrap_or(SqlValue::Null));
    }
    Ok(row)
}
