// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Service
//!
//! Facade wiring the pieces together:
//!
//! ```text
//!                 publish()                       run()
//! business code ───────────▶ Publisher ──▶ outbox tables ──▶ OutboxPoller (per topic)
//!                                                                 │
//!                                                   Pipeline + ForwardingHandler
//!                                                                 │
//! add_subscription() ◀──── Pipeline ◀──── Bus::subscribe ◀──── Bus::publish
//! ```
//!
//! One forwarding subscription is wired per mapped topic. Subscriptions added
//! with [`OutboxService::add_subscription`] read the bus directly and never
//! touch the outbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use crate::bus::{Bus, MessageStream};
use crate::config::OutboxConfig;
use crate::database::{Database, Executor};
use crate::errors::{OutboxError, OutboxResult};
use crate::forwarder::ForwardingHandler;
use crate::message::Message;
use crate::middleware::{BoxedHandler, Pipeline};
use crate::poller::{initialize_topic, OutboxPoller};
use crate::publisher::Publisher;
use crate::router::TopicRouter;
use crate::state_machine::SubscriptionState;

/// Service lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

struct AdHocSubscription {
    topic: String,
    handler: BoxedHandler,
}

type TaskResult = (String, OutboxResult<()>);

pub struct OutboxService {
    config: OutboxConfig,
    router: Arc<TopicRouter>,
    db: Arc<dyn Database>,
    bus: Arc<dyn Bus>,
    subscriptions: mpsc::UnboundedSender<AdHocSubscription>,
    queued: Mutex<Option<mpsc::UnboundedReceiver<AdHocSubscription>>>,
    states: Mutex<HashMap<String, watch::Receiver<SubscriptionState>>>,
    lifecycle: watch::Sender<Lifecycle>,
    shutdown: CancellationToken,
    span: Span,
}

impl OutboxService {
    /// Validate `config` and wire one forwarding subscription per mapped topic
    pub fn new(config: OutboxConfig, db: Arc<dyn Database>, bus: Arc<dyn Bus>) -> OutboxResult<Self> {
        Self::with_span(config, db, bus, info_span!("outbox"))
    }

    /// Like [`OutboxService::new`], logging under `span`
    pub fn with_span(
        config: OutboxConfig,
        db: Arc<dyn Database>,
        bus: Arc<dyn Bus>,
        span: Span,
    ) -> OutboxResult<Self> {
        let router = Arc::new(TopicRouter::new(&config)?);
        for (topic, table) in router.routes() {
            info!(parent: &span, topic, table, "Configured outbox table for topic");
        }

        let (subscriptions, queued) = mpsc::unbounded_channel();
        let (lifecycle, _) = watch::channel(Lifecycle::Idle);

        Ok(Self {
            config,
            router,
            db,
            bus,
            subscriptions,
            queued: Mutex::new(Some(queued)),
            states: Mutex::new(HashMap::new()),
            lifecycle,
            shutdown: CancellationToken::new(),
            span,
        })
    }

    pub fn router(&self) -> &Arc<TopicRouter> {
        &self.router
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.borrow()
    }

    /// State of the forwarding subscription for `topic`, once running
    pub fn subscription_state(&self, topic: &str) -> Option<SubscriptionState> {
        self.states
            .lock()
            .ok()
            .and_then(|states| states.get(topic).map(|rx| *rx.borrow()))
    }

    /// Create every outbox table and register the forwarding consumers
    ///
    /// `run` does this per topic as well; calling it first lets publishes
    /// succeed before the pollers have started.
    pub async fn initialize(&self) -> OutboxResult<()> {
        for (topic, table) in self.router.routes() {
            initialize_topic(
                self.db.as_ref(),
                &self.router,
                table,
                &self.config.consumer_group,
                topic,
            )
            .instrument(self.span.clone())
            .await?;
            debug!(parent: &self.span, topic, table, "Outbox table ready");
        }
        Ok(())
    }

    /// Publisher on the service's own connection
    pub fn publisher(&self) -> Publisher<'_, dyn Database> {
        Publisher::new(self.router.clone(), self.db.as_ref(), self.span.clone())
    }

    /// Publisher writing through `executor`, typically the caller's transaction
    pub fn with_tx<'a, E: Executor + ?Sized>(&self, executor: &'a E) -> Publisher<'a, E> {
        Publisher::new(self.router.clone(), executor, self.span.clone())
    }

    /// Publish outside any caller transaction
    pub async fn publish(&self, topic: &str, messages: Vec<Message>) -> OutboxResult<()> {
        self.publisher().publish(topic, messages).await
    }

    /// Consume `topic` straight from the bus
    ///
    /// Takes effect when the service runs, or immediately if it already is.
    pub fn add_subscription(&self, topic: impl Into<String>, handler: BoxedHandler) -> OutboxResult<()> {
        let topic = topic.into();
        if self.lifecycle() == Lifecycle::Stopped {
            return Err(OutboxError::Stopped);
        }
        info!(parent: &self.span, topic = %topic, "Adding subscription");
        self.subscriptions
            .send(AdHocSubscription { topic, handler })
            .map_err(|_| OutboxError::Stopped)
    }

    /// Run every subscription until `ctx` is cancelled or
    /// [`OutboxService::shutdown`] is called
    ///
    /// May be called once.
    pub async fn run(&self, ctx: CancellationToken) -> OutboxResult<()> {
        let started = self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Idle {
                *state = Lifecycle::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(OutboxError::AlreadyRunning);
        }

        let result = self.supervise(ctx).instrument(self.span.clone()).await;
        self.lifecycle.send_replace(Lifecycle::Stopped);
        info!(parent: &self.span, "Outbox service stopped");
        result
    }

    async fn supervise(&self, ctx: CancellationToken) -> OutboxResult<()> {
        let mut queued = self
            .queued
            .lock()
            .ok()
            .and_then(|mut q| q.take())
            .ok_or(OutboxError::AlreadyRunning)?;

        let cancel = self.shutdown.child_token();
        let pipeline = Pipeline::standard(self.config.retry.clone(), cancel.clone(), self.span.clone());
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();

        for (topic, _) in self.router.routes() {
            let forwarder = ForwardingHandler::new(self.bus.clone(), self.span.clone());
            let poller = OutboxPoller::new(
                topic,
                &self.config,
                self.router.clone(),
                self.db.clone(),
                pipeline.wrap(Arc::new(forwarder)),
                &self.span,
            )?;
            if let Ok(mut states) = self.states.lock() {
                states.insert(topic.to_string(), poller.watch_state());
            }

            let cancel = cancel.clone();
            tasks.spawn(async move {
                let result = poller.run(cancel).await;
                (poller.topic().to_string(), result)
            });
        }
        info!(topics = tasks.len(), "Outbox service running");

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = cancel.cancelled() => break,
                Some(sub) = queued.recv() => {
                    self.spawn_subscription(&mut tasks, &pipeline, &cancel, sub).await;
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_finished(joined),
            }
        }

        cancel.cancel();
        queued.close();
        while let Some(joined) = tasks.join_next().await {
            log_finished(joined);
        }
        Ok(())
    }

    async fn spawn_subscription(
        &self,
        tasks: &mut JoinSet<TaskResult>,
        pipeline: &Pipeline,
        cancel: &CancellationToken,
        sub: AdHocSubscription,
    ) {
        let stream = match self.bus.subscribe(&sub.topic).await {
            Ok(stream) => stream,
            Err(e) => {
                error!(topic = %sub.topic, error = %e, "Failed to subscribe");
                return;
            }
        };

        let handler = pipeline.wrap(sub.handler);
        let cancel = cancel.clone();
        let span = self.span.clone();
        tasks.spawn(async move {
            consume(&sub.topic, stream, handler, cancel, span).await;
            (sub.topic, Ok(()))
        });
    }

    /// Stop delivering and wait for in-flight work to finish
    ///
    /// Safe to call any number of times, before or after `run`.
    pub async fn shutdown(&self) -> OutboxResult<()> {
        self.shutdown.cancel();

        let never_ran = self.lifecycle.send_if_modified(|state| {
            if *state == Lifecycle::Idle {
                *state = Lifecycle::Stopped;
                true
            } else {
                false
            }
        });
        if never_ran {
            info!(parent: &self.span, "Outbox service stopped before running");
            return Ok(());
        }

        let mut lifecycle = self.lifecycle.subscribe();
        if lifecycle
            .wait_for(|state| *state == Lifecycle::Stopped)
            .await
            .is_err()
        {
            warn!(parent: &self.span, "Lifecycle channel closed during shutdown");
        }
        Ok(())
    }
}

/// Deliver bus messages on `topic` until the stream ends or `cancel` fires
async fn consume(
    topic: &str,
    mut stream: MessageStream,
    handler: BoxedHandler,
    cancel: CancellationToken,
    span: Span,
) {
    info!(parent: &span, topic, "Subscription started");
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let delivery = info_span!(parent: &span, "outbox.subscribe", topic);
        let uuid = message.uuid;
        if let Err(e) = handler.handle(message).instrument(delivery).await {
            warn!(parent: &span, topic, message_uuid = %uuid, error = %e, "Subscriber failed");
        }
    }
    info!(parent: &span, topic, "Subscription ended");
}

fn log_finished(joined: Result<TaskResult, tokio::task::JoinError>) {
    match joined {
        Ok((topic, Ok(()))) => info!(topic = %topic, "Subscription finished"),
        Ok((topic, Err(e))) => error!(topic = %topic, error = %e, "Subscription failed"),
        Err(e) => error!(error = %e, "Subscription task aborted"),
    }
}
