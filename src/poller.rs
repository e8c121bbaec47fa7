// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Poller
//!
//! One poller per subscribed topic. Each tick reads the rows after the
//! consumer's offset, ascending by ordering token, and pushes them through
//! the handler one at a time:
//!
//! ```text
//! ┌────────┐  rows > offset   ┌──────────┐  Ok   ┌────────────────┐
//! │ outbox │ ───────────────▶ │ pipeline │ ────▶ │ advance offset │ ──▶ next row
//! │ table  │                  └──────────┘       └────────────────┘
//! └────────┘                       │ Err
//!      ▲                           ▼
//!      └──── revisited next tick ── stop tick
//! ```
//!
//! A failed row ends the tick so nothing after it is acknowledged first. The
//! offset is only written after the handler succeeded; a crash in between
//! redelivers the row. A row that cannot be decoded is logged and
//! acknowledged without delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::config::OutboxConfig;
use crate::database::{Database, Executor};
use crate::errors::{OutboxError, OutboxResult};
use crate::middleware::BoxedHandler;
use crate::router::TopicRouter;
use crate::state_machine::{StateMachine, SubscriptionEvent, SubscriptionState};

/// What one tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub acknowledged: usize,
    /// Rows whose delivery or offset advance failed; at most one per tick
    pub unacknowledged: usize,
}

pub struct OutboxPoller {
    topic: String,
    table: String,
    consumer_group: String,
    poll_interval: Duration,
    batch_size: u32,
    router: Arc<TopicRouter>,
    db: Arc<dyn Database>,
    handler: BoxedHandler,
    state: watch::Sender<SubscriptionState>,
    span: Span,
}

impl OutboxPoller {
    /// Poller for `topic`, delivering to an already wrapped `handler`
    pub fn new(
        topic: &str,
        config: &OutboxConfig,
        router: Arc<TopicRouter>,
        db: Arc<dyn Database>,
        handler: BoxedHandler,
        span: &Span,
    ) -> OutboxResult<Self> {
        let table = router.table_for(topic)?.to_string();
        let span = info_span!(parent: span, "outbox.poller", topic = %topic, table = %table);
        let (state, _) = watch::channel(SubscriptionState::Uninitialized);

        Ok(Self {
            topic: topic.to_string(),
            table,
            consumer_group: config.consumer_group.clone(),
            poll_interval: config.poll_interval,
            batch_size: config.batch_size,
            router,
            db,
            handler,
            state,
            span,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Follow state changes from another task
    pub fn watch_state(&self) -> watch::Receiver<SubscriptionState> {
        self.state.subscribe()
    }

    fn record(&self, event: SubscriptionEvent) -> OutboxResult<SubscriptionState> {
        let next = self.state().transition(&event)?;
        self.state.send_replace(next);
        Ok(next)
    }

    /// Create the tables and register the consumer, in one transaction
    ///
    /// Safe to run concurrently from several processes and to repeat.
    pub async fn subscribe_initialize(&self) -> OutboxResult<()> {
        async {
            initialize_topic(
                self.db.as_ref(),
                &self.router,
                &self.table,
                &self.consumer_group,
                &self.topic,
            )
            .await?;

            self.record(SubscriptionEvent::Initialized)?;
            info!(consumer_group = %self.consumer_group, "Outbox subscription initialized");
            Ok(())
        }
        .instrument(self.span.clone())
        .await
    }

    /// Deliver the rows currently visible after the offset
    ///
    /// Stops early when `cancel` fires; the row being delivered finishes first.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> OutboxResult<PollReport> {
        self.tick(cancel).instrument(self.span.clone()).await
    }

    async fn tick(&self, cancel: &CancellationToken) -> OutboxResult<PollReport> {
        if self.state() == SubscriptionState::Initialized {
            self.record(SubscriptionEvent::PollStarted)?;
        }

        let dialect = self.router.dialect();
        let select = dialect.build_select_unconsumed(
            &self.table,
            &self.consumer_group,
            &self.topic,
            self.batch_size,
        );
        let rows = self.db.fetch_all(&select).await?;

        let mut report = PollReport {
            fetched: rows.len(),
            ..PollReport::default()
        };

        for row in &rows {
            if cancel.is_cancelled() {
                break;
            }

            let token = dialect.decode_token(row)?;
            self.record(SubscriptionEvent::RowFetched)?;

            match dialect.decode_row(row) {
                Ok(message) => {
                    if let Err(err) = self.handler.handle(message.to_message()).await {
                        warn!(
                            message_uuid = %message.uuid,
                            token = %token,
                            error = %err,
                            "Delivery failed, row left unacknowledged"
                        );
                        self.record(SubscriptionEvent::Nacked)?;
                        self.record(SubscriptionEvent::Resumed)?;
                        report.unacknowledged += 1;
                        break;
                    }
                }
                // Can never be delivered; acknowledged so it does not block the topic
                Err(err) => error!(token = %token, error = %err, "Dropping undecodable outbox row"),
            }

            let advance = dialect.build_offset_advance(
                &self.table,
                &self.consumer_group,
                &self.topic,
                token,
            );
            if let Err(err) = self.db.execute(&advance).await {
                // Delivered but not acknowledged: the row comes round again
                warn!(token = %token, error = %err, "Failed to advance offset");
                self.record(SubscriptionEvent::Nacked)?;
                self.record(SubscriptionEvent::Resumed)?;
                report.unacknowledged += 1;
                break;
            }

            self.record(SubscriptionEvent::Acked)?;
            self.record(SubscriptionEvent::Resumed)?;
            report.acknowledged += 1;
        }

        Ok(report)
    }

    /// Initialize if needed, then poll until `cancel` fires
    ///
    /// A full batch is followed by another tick straight away; otherwise the
    /// poller sleeps for the poll interval.
    pub async fn run(&self, cancel: CancellationToken) -> OutboxResult<()> {
        let result = self.run_loop(&cancel).instrument(self.span.clone()).await;

        if !self.state().is_terminal() {
            self.record(SubscriptionEvent::Stopped)?;
        }
        match &result {
            Ok(()) => info!(parent: &self.span, "Outbox poller stopped"),
            Err(e) => error!(parent: &self.span, error = %e, "Outbox poller failed"),
        }
        result
    }

    async fn run_loop(&self, cancel: &CancellationToken) -> OutboxResult<()> {
        if self.state() == SubscriptionState::Uninitialized {
            self.subscribe_initialize().await?;
        }
        info!(
            interval_ms = self.poll_interval.as_millis() as u64,
            "Polling outbox"
        );

        while !cancel.is_cancelled() {
            let full_batch = match self.poll_once(cancel).await {
                Ok(report) => {
                    if report.fetched > 0 {
                        debug!(
                            fetched = report.fetched,
                            acknowledged = report.acknowledged,
                            "Poll tick finished"
                        );
                    }
                    report.acknowledged == self.batch_size as usize
                }
                Err(OutboxError::State(e)) => return Err(e.into()),
                Err(e) => {
                    error!(error = %e, "Poll tick failed");
                    false
                }
            };

            if full_batch {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        Ok(())
    }
}

/// Run the dialect's initialization statements for one topic in a single
/// transaction
pub(crate) async fn initialize_topic(
    db: &dyn Database,
    router: &TopicRouter,
    table: &str,
    consumer_group: &str,
    topic: &str,
) -> OutboxResult<()> {
    let statements = router
        .dialect()
        .build_initialize(table, consumer_group, topic);

    let tx = db.begin().await?;
    for statement in &statements {
        tx.execute(statement).await?;
    }
    tx.commit().await?;
    Ok(())
}
