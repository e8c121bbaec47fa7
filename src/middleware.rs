// Copyright (c) 2025 - Cowboy AI, Inc.
//! Middleware Pipeline
//!
//! Every delivered message passes through the same ordered stages before
//! its handler runs:
//!
//! ```text
//! Message ──▶ CorrelationId ──▶ Retry ──▶ Recoverer ──▶ Handler
//!                                 ▲            │
//!                                 └── Err ◀────┘  (panics become Err here)
//! ```
//!
//! The first middleware added is the outermost. A handler failure is an
//! ordinary [`DeliveryError`]; nothing that happens inside a handler can take
//! the calling task down.
//!
//! # Example
//!
//! ```rust
//! use cim_outbox::middleware::{handler_fn, Pipeline, RetryPolicy};
//! use tokio_util::sync::CancellationToken;
//!
//! let pipeline = Pipeline::standard(
//!     RetryPolicy::default(),
//!     CancellationToken::new(),
//!     tracing::Span::none(),
//! );
//! let handler = pipeline.wrap(handler_fn(|_msg| async { Ok(()) }));
//! # let _ = handler;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::errors::{DeliveryError, DeliveryResult, OutboxError, OutboxResult};
use crate::message::{Message, CORRELATION_ID_KEY};

/// Processes one message
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> DeliveryResult;
}

/// Shared, type-erased handler
pub type BoxedHandler = Arc<dyn MessageHandler>;

/// Handler backed by an async closure
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = DeliveryResult> + Send,
{
    async fn handle(&self, message: Message) -> DeliveryResult {
        (self.f)(message).await
    }
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> BoxedHandler
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeliveryResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handler that decodes a JSON payload before calling `f`
pub struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> MessageHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = DeliveryResult> + Send,
{
    async fn handle(&self, message: Message) -> DeliveryResult {
        let payload: T = message
            .decode_json()
            .map_err(|e| DeliveryError::Payload(e.to_string()))?;
        (self.f)(payload).await
    }
}

/// Wrap a typed async closure; undecodable payloads fail delivery
pub fn json_handler<T, F, Fut>(f: F) -> BoxedHandler
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DeliveryResult> + Send + 'static,
{
    Arc::new(JsonHandler {
        f,
        _payload: PhantomData,
    })
}

/// Decorates a handler
pub trait Middleware: Send + Sync {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler;
}

/// Ordered middleware stack
#[derive(Clone, Default)]
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Correlation, retry with `policy`, then panic recovery
    pub fn standard(policy: RetryPolicy, cancel: CancellationToken, span: Span) -> Self {
        Self::new()
            .with(CorrelationId::new(span))
            .with(Retry::new(policy, cancel))
            .with(Recoverer)
    }

    /// Append a middleware inside the ones already added
    pub fn with(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn wrap(&self, handler: BoxedHandler) -> BoxedHandler {
        self.middlewares
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware.wrap(next))
    }
}

// ============================================================================
// Correlation
// ============================================================================

/// Ensures every message carries a `correlation_id` and runs it in a span
/// tagged with that id
#[derive(Clone)]
pub struct CorrelationId {
    span: Span,
}

impl CorrelationId {
    /// Message spans are created as children of `span`
    pub fn new(span: Span) -> Self {
        Self { span }
    }
}

impl Middleware for CorrelationId {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Correlated {
            next,
            span: self.span.clone(),
        })
    }
}

struct Correlated {
    next: BoxedHandler,
    span: Span,
}

#[async_trait]
impl MessageHandler for Correlated {
    async fn handle(&self, mut message: Message) -> DeliveryResult {
        let correlation_id = message
            .metadata
            .entry(CORRELATION_ID_KEY.to_string())
            .or_insert_with(|| Uuid::now_v7().to_string())
            .clone();

        let span = info_span!(
            parent: &self.span,
            "outbox.message",
            message_uuid = %message.uuid,
            correlation_id = %correlation_id,
        );
        self.next.handle(message).instrument(span).await
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Exponential backoff between handler attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_millis(200),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (zero-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_interval.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Every delay a message sees before giving up
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|r| self.delay_for(r)).collect()
    }

    pub fn validate(&self) -> OutboxResult<()> {
        if self.initial_interval.is_zero() {
            return Err(OutboxError::Configuration(
                "initial backoff must be positive".into(),
            ));
        }
        if !(self.multiplier > 1.0) {
            return Err(OutboxError::Configuration(format!(
                "backoff multiplier must be greater than 1, got {}",
                self.multiplier
            )));
        }
        if self.max_interval < self.initial_interval {
            return Err(OutboxError::Configuration(
                "max backoff must not be below the initial backoff".into(),
            ));
        }
        Ok(())
    }
}

/// Re-runs failed deliveries with exponential backoff
///
/// Cancellation cuts a backoff sleep short; an attempt already running is
/// left to finish.
#[derive(Clone)]
pub struct Retry {
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl Retry {
    pub fn new(policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self { policy, cancel }
    }
}

impl Middleware for Retry {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Retrying {
            next,
            policy: self.policy.clone(),
            cancel: self.cancel.clone(),
        })
    }
}

struct Retrying {
    next: BoxedHandler,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

#[async_trait]
impl MessageHandler for Retrying {
    async fn handle(&self, message: Message) -> DeliveryResult {
        let mut retry = 0u32;
        loop {
            let err = match self.next.handle(message.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            if retry >= self.policy.max_retries {
                error!(attempts = retry + 1, error = %err, "Giving up on message");
                return Err(DeliveryError::RetriesExhausted {
                    attempts: retry + 1,
                    last: Box::new(err),
                });
            }

            let delay = self.policy.delay_for(retry);
            retry += 1;
            warn!(
                attempt = retry,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(DeliveryError::Cancelled { last: Box::new(err) });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Converts handler panics into [`DeliveryError::RecoveredFault`]
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverer;

impl Middleware for Recoverer {
    fn wrap(&self, next: BoxedHandler) -> BoxedHandler {
        Arc::new(Recovering { next })
    }
}

struct Recovering {
    next: BoxedHandler,
}

#[async_trait]
impl MessageHandler for Recovering {
    async fn handle(&self, message: Message) -> DeliveryResult {
        let uuid = message.uuid;
        match AssertUnwindSafe(self.next.handle(message)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(message_uuid = %uuid, reason = %reason, "Recovered from handler panic");
                Err(DeliveryError::RecoveredFault(reason))
            }
        }
    }
}
