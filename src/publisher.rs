// Copyright (c) 2025 - Cowboy AI, Inc.
//! Transactional Publisher
//!
//! Writes outbox rows through whatever [`Executor`] the caller hands it. Bind
//! it to an open transaction and the event rows commit or roll back together
//! with the caller's own writes:
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use cim_outbox::{Database, Executor, Message, OutboxResult, Publisher, Statement, TopicRouter};
//! # async fn example(db: &dyn Database, router: Arc<TopicRouter>) -> OutboxResult<()> {
//! let tx = db.begin().await?;
//! tx.execute(&Statement::raw("UPDATE products SET price = 12 WHERE sku = 'A-1'")).await?;
//!
//! let publisher = Publisher::new(router, &*tx, tracing::Span::none());
//! publisher.publish("product.updated", vec![Message::new("A-1")]).await?;
//!
//! tx.commit().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{debug, info_span, Instrument, Span};

use crate::database::Executor;
use crate::errors::OutboxResult;
use crate::message::Message;
use crate::router::TopicRouter;

/// Publisher bound to one executor
pub struct Publisher<'a, E: Executor + ?Sized> {
    router: Arc<TopicRouter>,
    executor: &'a E,
    span: Span,
}

impl<'a, E: Executor + ?Sized> Publisher<'a, E> {
    pub fn new(router: Arc<TopicRouter>, executor: &'a E, span: Span) -> Self {
        Self {
            router,
            executor,
            span,
        }
    }

    /// Same routing, different executor
    pub fn with_tx<'b, T: Executor + ?Sized>(&self, executor: &'b T) -> Publisher<'b, T> {
        Publisher {
            router: self.router.clone(),
            executor,
            span: self.span.clone(),
        }
    }

    /// Write `messages` to `topic`'s outbox table in one statement
    ///
    /// Any failure writes nothing and is returned so the caller can roll back.
    /// An empty batch writes nothing but is still checked against the routes.
    pub async fn publish(&self, topic: &str, mut messages: Vec<Message>) -> OutboxResult<()> {
        let span = info_span!(
            parent: &self.span,
            "outbox.publish",
            topic = %topic,
            count = messages.len(),
        );

        async move {
            let Some(statement) = self.router.build_insert(topic, &mut messages)? else {
                debug!("Nothing to publish");
                return Ok(());
            };
            let table = self.router.table_for(topic)?;
            let written = self.executor.execute(&statement).await?;
            debug!(table, rows = written, "Wrote outbox rows");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
