// Copyright (c) 2025 - Cowboy AI, Inc.
//! In-memory doubles for the database and the external bus
//!
//! [`MemoryDatabase`] reproduces the parts of the Postgres engine the outbox
//! relies on, driven by each statement's [`Operation`] and the bind layout of
//! the Postgres dialect:
//!
//! - transaction ids are assigned at a transaction's first write
//! - `offset` is a sequence, consumed even by transactions that roll back
//! - rows become visible on commit, and only once every older transaction
//!   has finished (the `pg_snapshot_xmin` holdback)
//! - consumer offsets never move backwards
//!
//! Failures can be injected per operation. [`RecordingBus`] keeps every
//! publish and can be told to reject the next few.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::bus::{Bus, BusError, InMemoryBus, MessageStream};
use crate::database::{Database, Executor, Operation, Row, SqlValue, Statement, Transaction};
use crate::errors::{DatabaseError, DatabaseResult};
use crate::message::{Message, Metadata, OrderingToken, OutboxMessage};

type ConsumerKey = (String, String, String);

#[derive(Debug, Clone)]
struct StoredRow {
    offset: i64,
    uuid: Uuid,
    payload: Vec<u8>,
    metadata: Value,
    transaction_id: i64,
    created_at: DateTime<Utc>,
}

impl StoredRow {
    fn token(&self) -> OrderingToken {
        OrderingToken::new(self.transaction_id, self.offset)
    }

    fn topic(&self) -> Option<&str> {
        self.metadata.get("destination_topic").and_then(Value::as_str)
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("offset", self.offset)
            .with("uuid", self.uuid)
            .with("payload", self.payload.clone())
            .with("metadata", self.metadata.clone())
            .with("transaction_id", self.transaction_id)
            .with("created_at", self.created_at)
    }
}

#[derive(Debug)]
enum Pending {
    Rows { table: String, rows: Vec<StoredRow> },
    Register(ConsumerKey),
    Advance(ConsumerKey, OrderingToken),
}

#[derive(Debug, Default)]
struct TxState {
    txid: Option<i64>,
    pending: Vec<Pending>,
}

#[derive(Debug, Default)]
struct Faults {
    inserts: u32,
    selects: u32,
    offset_advances: u32,
}

fn take(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

#[derive(Debug)]
struct Store {
    next_txid: i64,
    active: BTreeSet<i64>,
    sequences: HashMap<String, i64>,
    tables: HashMap<String, Vec<StoredRow>>,
    offsets: HashMap<ConsumerKey, OrderingToken>,
    statements: Vec<Statement>,
    faults: Faults,
}

impl Default for Store {
    fn default() -> Self {
        Self {
            // Postgres hands out normal xids from 3
            next_txid: 3,
            active: BTreeSet::new(),
            sequences: HashMap::new(),
            tables: HashMap::new(),
            offsets: HashMap::new(),
            statements: Vec::new(),
            faults: Faults::default(),
        }
    }
}

fn text_arg(statement: &Statement, i: usize) -> DatabaseResult<String> {
    match statement.args.get(i) {
        Some(SqlValue::Text(v)) => Ok(v.clone()),
        other => Err(DatabaseError::Decode(format!(
            "argument {} expected TEXT, got {:?}",
            i + 1,
            other
        ))),
    }
}

fn int_arg(statement: &Statement, i: usize) -> DatabaseResult<i64> {
    match statement.args.get(i) {
        Some(SqlValue::BigInt(v)) => Ok(*v),
        other => Err(DatabaseError::Decode(format!(
            "argument {} expected BIGINT, got {:?}",
            i + 1,
            other
        ))),
    }
}

impl Store {
    /// Oldest transaction still running, as `pg_snapshot_xmin` reports it
    fn xmin(&self) -> i64 {
        self.active.first().copied().unwrap_or(self.next_txid)
    }

    fn assign_txid(&mut self, tx: &mut TxState) -> i64 {
        *tx.txid.get_or_insert_with(|| {
            let txid = self.next_txid;
            self.next_txid += 1;
            self.active.insert(txid);
            txid
        })
    }

    fn execute(&mut self, tx: &mut TxState, statement: &Statement) -> DatabaseResult<u64> {
        self.statements.push(statement.clone());

        match &statement.operation {
            Operation::Insert { table, rows } => {
                if take(&mut self.faults.inserts) {
                    return Err(DatabaseError::Injected("insert".into()));
                }
                let txid = self.assign_txid(tx);
                let mut stored = Vec::with_capacity(*rows);
                for chunk in statement.args.chunks(3) {
                    let [SqlValue::Uuid(uuid), SqlValue::Bytes(payload), SqlValue::Json(metadata)] =
                        chunk
                    else {
                        return Err(DatabaseError::Decode(format!(
                            "unexpected insert arguments {:?}",
                            chunk
                        )));
                    };
                    let sequence = self.sequences.entry(table.clone()).or_insert(0);
                    *sequence += 1;
                    stored.push(StoredRow {
                        offset: *sequence,
                        uuid: *uuid,
                        payload: payload.clone(),
                        metadata: metadata.clone(),
                        transaction_id: txid,
                        created_at: Utc::now(),
                    });
                }
                let count = stored.len() as u64;
                tx.pending.push(Pending::Rows {
                    table: table.clone(),
                    rows: stored,
                });
                Ok(count)
            }
            Operation::RegisterConsumer { table } => {
                let key = (table.clone(), text_arg(statement, 0)?, text_arg(statement, 1)?);
                self.assign_txid(tx);
                tx.pending.push(Pending::Register(key));
                Ok(1)
            }
            Operation::AdvanceOffset { table } => {
                if take(&mut self.faults.offset_advances) {
                    return Err(DatabaseError::Injected("offset advance".into()));
                }
                let key = (table.clone(), text_arg(statement, 0)?, text_arg(statement, 1)?);
                let token = OrderingToken::new(int_arg(statement, 3)?, int_arg(statement, 2)?);
                self.assign_txid(tx);
                tx.pending.push(Pending::Advance(key, token));
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    fn fetch_all(&mut self, statement: &Statement) -> DatabaseResult<Vec<Row>> {
        self.statements.push(statement.clone());

        let Operation::SelectUnconsumed { table } = &statement.operation else {
            return Ok(Vec::new());
        };
        if take(&mut self.faults.selects) {
            return Err(DatabaseError::Injected("select".into()));
        }

        let group = text_arg(statement, 0)?;
        let topic = text_arg(statement, 1)?;
        let limit = usize::try_from(int_arg(statement, 2)?).unwrap_or(0);
        let key = (table.clone(), group, topic);

        // Unregistered consumers see nothing, as the inner join does
        let Some(acked) = self.offsets.get(&key).copied() else {
            return Ok(Vec::new());
        };
        let xmin = self.xmin();

        let mut rows: Vec<&StoredRow> = self
            .tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.topic().map_or(true, |t| t == key.2))
                    .filter(|r| r.token() > acked && r.transaction_id < xmin)
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|r| r.token());

        Ok(rows.into_iter().take(limit).map(StoredRow::to_row).collect())
    }

    fn finish(&mut self, tx: &mut TxState, commit: bool) {
        let pending = std::mem::take(&mut tx.pending);
        if commit {
            for op in pending {
                match op {
                    Pending::Rows { table, rows } => {
                        self.tables.entry(table).or_default().extend(rows);
                    }
                    Pending::Register(key) => {
                        self.offsets.entry(key).or_default();
                    }
                    Pending::Advance(key, token) => {
                        let current = self.offsets.entry(key).or_default();
                        if token > *current {
                            *current = token;
                        }
                    }
                }
            }
        }
        if let Some(txid) = tx.txid.take() {
            self.active.remove(&txid);
        }
    }
}

fn lock(store: &Mutex<Store>) -> MutexGuard<'_, Store> {
    // A panicking test thread must not hide the state from the others
    store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Postgres-like database held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<Store>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed rows of `table`, ascending by ordering token
    pub fn rows(&self, table: &str) -> Vec<OutboxMessage> {
        let store = lock(&self.store);
        let mut rows: Vec<OutboxMessage> = store
            .tables
            .get(table)
            .into_iter()
            .flatten()
            .map(|r| OutboxMessage {
                uuid: r.uuid,
                payload: Bytes::from(r.payload.clone()),
                metadata: serde_json::from_value::<Metadata>(r.metadata.clone())
                    .unwrap_or_default(),
                ordering_token: r.token(),
                created_at: r.created_at,
            })
            .collect();
        rows.sort_by_key(|r| r.ordering_token);
        rows
    }

    /// Acknowledged offset of a consumer, if it is registered
    pub fn offset(&self, table: &str, consumer_group: &str, topic: &str) -> Option<OrderingToken> {
        let key = (table.to_string(), consumer_group.to_string(), topic.to_string());
        lock(&self.store).offsets.get(&key).copied()
    }

    /// Every statement run so far, in order
    pub fn statements(&self) -> Vec<Statement> {
        lock(&self.store).statements.clone()
    }

    pub fn statement_count(&self) -> usize {
        lock(&self.store).statements.len()
    }

    /// Fail the next `n` inserts
    pub fn fail_inserts(&self, n: u32) {
        lock(&self.store).faults.inserts = n;
    }

    /// Fail the next `n` unconsumed-row selects
    pub fn fail_selects(&self, n: u32) {
        lock(&self.store).faults.selects = n;
    }

    /// Fail the next `n` offset advances
    pub fn fail_offset_advances(&self, n: u32) {
        lock(&self.store).faults.offset_advances = n;
    }
}

#[async_trait]
impl Executor for MemoryDatabase {
    async fn execute(&self, statement: &Statement) -> DatabaseResult<u64> {
        let mut store = lock(&self.store);
        let mut tx = TxState::default();
        let result = store.execute(&mut tx, statement);
        store.finish(&mut tx, result.is_ok());
        result
    }

    async fn fetch_all(&self, statement: &Statement) -> DatabaseResult<Vec<Row>> {
        lock(&self.store).fetch_all(statement)
    }
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn begin(&self) -> DatabaseResult<Box<dyn Transaction>> {
        Ok(Box::new(MemoryTransaction {
            store: self.store.clone(),
            state: Mutex::new(TxState::default()),
        }))
    }
}

/// Open transaction on a [`MemoryDatabase`]; rolls back when dropped
#[derive(Debug)]
pub struct MemoryTransaction {
    store: Arc<Mutex<Store>>,
    state: Mutex<TxState>,
}

impl MemoryTransaction {
    fn finish(&self, commit: bool) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        lock(&self.store).finish(&mut state, commit);
    }
}

#[async_trait]
impl Executor for MemoryTransaction {
    async fn execute(&self, statement: &Statement) -> DatabaseResult<u64> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        lock(&self.store).execute(&mut state, statement)
    }

    async fn fetch_all(&self, statement: &Statement) -> DatabaseResult<Vec<Row>> {
        lock(&self.store).fetch_all(statement)
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> DatabaseResult<()> {
        self.finish(true);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> DatabaseResult<()> {
        self.finish(false);
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        // No-op after commit or rollback: the txid has already been released
        self.finish(false);
    }
}

/// Bus that records every accepted publish
#[derive(Debug, Default)]
pub struct RecordingBus {
    inner: InMemoryBus,
    published: Mutex<Vec<(String, Message)>>,
    failures: AtomicU32,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the next `n` publishes
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Accepted publishes, in order
    pub fn published(&self) -> Vec<(String, Message)> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Live subscribers on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner.subscriber_count(topic)
    }

    pub fn published_to(&self, topic: &str) -> Vec<Message> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m)
            .collect()
    }
}

#[async_trait]
impl Bus for RecordingBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BusError::Publish {
                topic: topic.to_string(),
                reason: "injected failure".into(),
            });
        }

        if let Ok(mut published) = self.published.lock() {
            published.push((topic.to_string(), message.clone()));
        }
        self.inner.publish(topic, message).await
    }

    async fn subscribe(&self, topic: &str) -> Result<MessageStream, BusError> {
        self.inner.subscribe(topic).await
    }

    async fn close(&self) -> Result<(), BusError> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{OutboxDialect, PostgresDialect};

    fn insert(topic: &str, payload: &'static str) -> Statement {
        let message = Message::new(payload).with_metadata("destination_topic", topic);
        PostgresDialect.build_insert("t", &[message]).unwrap()
    }

    fn select() -> Statement {
        PostgresDialect.build_select_unconsumed("t", "g", "topic", 10)
    }

    async fn register(db: &MemoryDatabase) {
        for statement in PostgresDialect.build_initialize("t", "g", "topic") {
            db.execute(&statement).await.unwrap();
        }
    }

    #[tokio::test]
    async fn open_transaction_holds_back_later_commits() {
        let db = MemoryDatabase::new();
        register(&db).await;

        let slow = db.begin().await.unwrap();
        slow.execute(&insert("topic", "slow")).await.unwrap();
        db.execute(&insert("topic", "fast")).await.unwrap();

        let stmt = select();
        assert!(db.fetch_all(&stmt).await.unwrap().is_empty());

        slow.commit().await.unwrap();
        let rows = db.fetch_all(&stmt).await.unwrap();
        let payloads: Vec<Vec<u8>> = rows
            .iter()
            .map(|r| r.get_bytes("payload").unwrap())
            .collect();
        assert_eq!(payloads, vec![b"slow".to_vec(), b"fast".to_vec()]);
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() {
        let db = MemoryDatabase::new();
        {
            let tx = db.begin().await.unwrap();
            tx.execute(&insert("topic", "gone")).await.unwrap();
        }
        db.execute(&insert("topic", "kept")).await.unwrap();

        let rows = db.rows("t");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].payload, "kept");
        // The rolled-back insert still consumed a sequence value
        assert_eq!(rows[0].ordering_token.offset, 2);
    }

    #[tokio::test]
    async fn offsets_never_regress() {
        let db = MemoryDatabase::new();
        register(&db).await;

        let advance = |tx, off| {
            PostgresDialect.build_offset_advance("t", "g", "topic", OrderingToken::new(tx, off))
        };
        db.execute(&advance(9, 4)).await.unwrap();
        db.execute(&advance(9, 2)).await.unwrap();

        assert_eq!(db.offset("t", "g", "topic"), Some(OrderingToken::new(9, 4)));
    }

    #[tokio::test]
    async fn recording_bus_rejects_then_records() {
        let bus = RecordingBus::new();
        bus.fail_next(1);

        assert!(bus.publish("t", Message::new("1")).await.is_err());
        bus.publish("t", Message::new("2")).await.unwrap();

        let published = bus.published_to("t");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, "2");
    }
}
