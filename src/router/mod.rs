// Copyright (c) 2025 - Cowboy AI, Inc.
//! Topic-Table Router
//!
//! Maps logical topics to physical outbox tables and builds statements for
//! them through the configured storage engine's [`OutboxDialect`].
//!
//! ```text
//! "product.created" ──▶ product_outbox
//! "product.updated" ──▶ product_outbox
//! "order.placed"    ──▶ order_outbox
//! "invoice.issued"  ──▶ ✗ UnroutedTopic (no fallback table)
//! ```

pub mod dialect;
pub mod postgres;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::OutboxConfig;
use crate::database::Statement;
use crate::errors::{OutboxError, OutboxResult};
use crate::message::{Message, DESTINATION_TOPIC_KEY};

pub use dialect::OutboxDialect;
pub use postgres::PostgresDialect;

/// Validated topic → table mapping
#[derive(Debug, Clone)]
pub struct TopicRouter {
    tables: Vec<String>,
    routes: BTreeMap<String, String>,
    dialect: Arc<dyn OutboxDialect>,
}

impl TopicRouter {
    /// Validate the mapping in `config` and pick its engine's dialect
    pub fn new(config: &OutboxConfig) -> OutboxResult<Self> {
        config.validate()?;
        Ok(Self {
            tables: config.table_names.clone(),
            routes: config.topic_to_table.clone(),
            dialect: config.engine.dialect(),
        })
    }

    /// Table for `topic`; never a fallback
    pub fn table_for(&self, topic: &str) -> OutboxResult<&str> {
        self.routes
            .get(topic)
            .map(String::as_str)
            .ok_or_else(|| OutboxError::UnroutedTopic(topic.to_string()))
    }

    /// Every `(topic, table)` pair, ordered by topic
    pub fn routes(&self) -> impl Iterator<Item = (&str, &str)> {
        self.routes.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn dialect(&self) -> &dyn OutboxDialect {
        self.dialect.as_ref()
    }

    /// Build the insert for `messages` on `topic`'s table
    ///
    /// Stamps `destination_topic` into each message first, since the
    /// physical table does not retain the logical topic. An empty batch on a
    /// mapped topic needs no statement and yields `None`.
    pub fn build_insert(
        &self,
        topic: &str,
        messages: &mut [Message],
    ) -> OutboxResult<Option<Statement>> {
        let table = self.table_for(topic)?;
        if messages.is_empty() {
            return Ok(None);
        }

        for msg in messages.iter_mut() {
            msg.metadata
                .insert(DESTINATION_TOPIC_KEY.to_string(), topic.to_string());
        }
        self.dialect.build_insert(table, messages).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Operation;

    fn router() -> TopicRouter {
        let config = OutboxConfig::new(
            ["product_outbox", "order_outbox"],
            [
                ("product.created", "product_outbox"),
                ("product.updated", "product_outbox"),
                ("order.placed", "order_outbox"),
            ],
        );
        TopicRouter::new(&config).unwrap()
    }

    #[test]
    fn mapped_topic_goes_to_its_table() {
        let mut msgs = vec![Message::new("p1"), Message::new("p2")];
        let stmt = router()
            .build_insert("order.placed", &mut msgs)
            .unwrap()
            .unwrap();

        assert_eq!(
            stmt.operation,
            Operation::Insert {
                table: "order_outbox".into(),
                rows: 2
            }
        );
        assert!(msgs
            .iter()
            .all(|m| m.destination_topic() == Some("order.placed")));
    }

    #[test]
    fn unmapped_topic_is_refused_without_fallback() {
        let mut msgs = vec![Message::new("p")];
        let err = router().build_insert("invoice.issued", &mut msgs).unwrap_err();

        assert!(matches!(err, OutboxError::UnroutedTopic(t) if t == "invoice.issued"));
        assert!(msgs[0].destination_topic().is_none());
    }

    #[test]
    fn empty_batch_needs_no_statement() {
        assert_eq!(router().build_insert("order.placed", &mut []).unwrap(), None);
        assert!(matches!(
            router().build_insert("invoice.issued", &mut []),
            Err(OutboxError::UnroutedTopic(_))
        ));
    }

    #[test]
    fn destination_topic_overrides_caller_value() {
        let mut msgs = vec![Message::new("p").with_metadata(DESTINATION_TOPIC_KEY, "spoofed")];
        router().build_insert("product.updated", &mut msgs).unwrap();

        assert_eq!(msgs[0].destination_topic(), Some("product.updated"));
    }

    #[test]
    fn construction_validates_mapping() {
        let config = OutboxConfig::new(["a"], [("t", "b")]);
        assert!(matches!(
            TopicRouter::new(&config),
            Err(OutboxError::Configuration(_))
        ));
    }
}
