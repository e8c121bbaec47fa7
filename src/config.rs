// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox configuration
//!
//! The topic-to-table map is validated once, at construction; a bad mapping
//! aborts startup instead of misrouting events at runtime.
//!
//! # Environment
//!
//! | Variable                    | Example                                   |
//! |-----------------------------|-------------------------------------------|
//! | `OUTBOX_TABLES`             | `product_outbox,order_outbox`             |
//! | `OUTBOX_TOPIC_MAP`          | `product.created=product_outbox,...`      |
//! | `OUTBOX_CONSUMER_GROUP`     | `outbox_forwarder`                        |
//! | `OUTBOX_POLL_INTERVAL_MS`   | `100`                                     |
//! | `OUTBOX_BATCH_SIZE`         | `100`                                     |
//! | `OUTBOX_MAX_RETRIES`        | `5`                                       |
//! | `OUTBOX_INITIAL_BACKOFF_MS` | `200`                                     |

use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{OutboxError, OutboxResult};
use crate::middleware::RetryPolicy;

/// Default interval between poll ticks
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default number of rows fetched per poll tick
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// Default consumer group recorded in the offsets tables
pub const DEFAULT_CONSUMER_GROUP: &str = "outbox_forwarder";

/// Postgres truncates identifiers beyond 63 bytes; leave room for `_offsets`
const MAX_TABLE_NAME_LEN: usize = 63 - "_offsets".len();

/// Storage engine the outbox tables live in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StorageEngine {
    #[default]
    Postgres,
}

impl FromStr for StorageEngine {
    type Err = OutboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Ok(StorageEngine::Postgres),
            other => Err(OutboxError::Configuration(format!(
                "unsupported storage engine '{}'",
                other
            ))),
        }
    }
}

/// Configuration for the outbox service
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Every physical outbox table
    pub table_names: Vec<String>,
    /// Logical topic → physical table; each table must be in `table_names`
    pub topic_to_table: BTreeMap<String, String>,
    pub engine: StorageEngine,
    /// Name under which offsets are tracked
    pub consumer_group: String,
    pub poll_interval: Duration,
    /// Upper bound on rows fetched per poll tick
    pub batch_size: u32,
    pub retry: RetryPolicy,
}

impl OutboxConfig {
    /// Configuration with default tuning for the given tables and routes
    pub fn new<T, R, K, V>(table_names: T, topic_to_table: R) -> Self
    where
        T: IntoIterator,
        T::Item: Into<String>,
        R: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            table_names: table_names.into_iter().map(Into::into).collect(),
            topic_to_table: topic_to_table
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            engine: StorageEngine::default(),
            consumer_group: DEFAULT_CONSUMER_GROUP.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Load configuration from `OUTBOX_*` environment variables
    pub fn from_env() -> OutboxResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> OutboxResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let tables = lookup("OUTBOX_TABLES").ok_or_else(|| missing("OUTBOX_TABLES"))?;
        let topic_map = lookup("OUTBOX_TOPIC_MAP").ok_or_else(|| missing("OUTBOX_TOPIC_MAP"))?;

        let table_names = split_list(&tables).map(str::to_string).collect::<Vec<_>>();
        let topic_to_table = split_list(&topic_map)
            .map(|pair| {
                pair.split_once('=')
                    .map(|(topic, table)| (topic.trim().to_string(), table.trim().to_string()))
                    .ok_or_else(|| {
                        OutboxError::Configuration(format!(
                            "OUTBOX_TOPIC_MAP entry '{}' is not topic=table",
                            pair
                        ))
                    })
            })
            .collect::<OutboxResult<BTreeMap<_, _>>>()?;

        let mut config = Self::new(table_names, topic_to_table);

        if let Some(engine) = lookup("OUTBOX_ENGINE") {
            config.engine = engine.parse()?;
        }
        if let Some(group) = lookup("OUTBOX_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "OUTBOX_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(size) = parse_var::<u32>(&lookup, "OUTBOX_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(retries) = parse_var::<u32>(&lookup, "OUTBOX_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "OUTBOX_INITIAL_BACKOFF_MS")? {
            config.retry.initial_interval = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the mapping and tuning values
    pub fn validate(&self) -> OutboxResult<()> {
        if self.table_names.is_empty() {
            return Err(OutboxError::Configuration(
                "table names cannot be empty".into(),
            ));
        }
        if self.topic_to_table.is_empty() {
            return Err(OutboxError::Configuration(
                "topic to table map cannot be empty".into(),
            ));
        }

        for table in &self.table_names {
            validate_table_name(table)?;
        }

        let declared: HashSet<&str> = self.table_names.iter().map(String::as_str).collect();
        for (topic, table) in &self.topic_to_table {
            if topic.trim().is_empty() {
                return Err(OutboxError::Configuration("topic cannot be empty".into()));
            }
            if !declared.contains(table.as_str()) {
                return Err(OutboxError::Configuration(format!(
                    "table '{}' for topic '{}' is not declared in table names",
                    table, topic
                )));
            }
        }

        if self.consumer_group.is_empty() {
            return Err(OutboxError::Configuration(
                "consumer group cannot be empty".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(OutboxError::Configuration(
                "poll interval must be positive".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(OutboxError::Configuration(
                "batch size must be positive".into(),
            ));
        }
        self.retry.validate()
    }
}

/// Accept `name` or `schema.name`, each part a plain SQL identifier
fn validate_table_name(table: &str) -> OutboxResult<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = table.split('.').collect();
    let well_formed = (1..=2).contains(&parts.len()) && parts.iter().all(|p| valid_part(p));

    if !well_formed {
        return Err(OutboxError::Configuration(format!(
            "'{}' is not a valid table name",
            table
        )));
    }
    if parts[parts.len() - 1].len() > MAX_TABLE_NAME_LEN {
        return Err(OutboxError::Configuration(format!(
            "table name '{}' exceeds {} characters",
            table, MAX_TABLE_NAME_LEN
        )));
    }
    Ok(())
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn missing(key: &str) -> OutboxError {
    OutboxError::Configuration(format!("{} not set", key))
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> OutboxResult<Option<T>> {
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|_| {
                OutboxError::Configuration(format!("{} has invalid value '{}'", key, raw))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn valid() -> OutboxConfig {
        OutboxConfig::new(
            ["product_outbox", "order_outbox"],
            [
                ("product.created", "product_outbox"),
                ("order.placed", "order_outbox"),
            ],
        )
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = valid();

        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.initial_interval, Duration::from_millis(200));
        assert_eq!(config.consumer_group, "outbox_forwarder");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_tables_are_rejected() {
        let config = OutboxConfig::new(Vec::<String>::new(), [("a", "t")]);
        assert!(matches!(config.validate(), Err(OutboxError::Configuration(_))));
    }

    #[test]
    fn empty_mapping_is_rejected() {
        let config = OutboxConfig::new(["t"], Vec::<(String, String)>::new());
        assert!(matches!(config.validate(), Err(OutboxError::Configuration(_))));
    }

    #[test]
    fn undeclared_table_is_rejected() {
        let mut config = valid();
        config
            .topic_to_table
            .insert("invoice.issued".into(), "invoice_outbox".into());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("invoice_outbox"));
    }

    #[test_case("outbox" ; "plain")]
    #[test_case("events.product_outbox" ; "schema qualified")]
    #[test_case("_outbox_2" ; "underscore and digits")]
    fn accepts_table_name(name: &str) {
        assert!(validate_table_name(name).is_ok());
    }

    #[test_case("" ; "empty")]
    #[test_case("2outbox" ; "leading digit")]
    #[test_case("outbox; DROP TABLE users" ; "injection")]
    #[test_case("a.b.c" ; "too many parts")]
    #[test_case("\"quoted\"" ; "quoted")]
    fn rejects_table_name(name: &str) {
        assert!(validate_table_name(name).is_err());
    }

    #[test]
    fn loads_from_lookup() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OUTBOX_TABLES", "product_outbox, order_outbox"),
            (
                "OUTBOX_TOPIC_MAP",
                "product.created=product_outbox,order.placed = order_outbox",
            ),
            ("OUTBOX_POLL_INTERVAL_MS", "250"),
            ("OUTBOX_MAX_RETRIES", "3"),
        ]);

        let config = OutboxConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.table_names, vec!["product_outbox", "order_outbox"]);
        assert_eq!(config.topic_to_table["order.placed"], "order_outbox");
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
    }

    #[test]
    fn malformed_env_values_are_configuration_errors() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("OUTBOX_TABLES", "t"),
            ("OUTBOX_TOPIC_MAP", "a=t"),
            ("OUTBOX_BATCH_SIZE", "lots"),
        ]);

        let err = OutboxConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap_err();
        assert!(err.to_string().contains("OUTBOX_BATCH_SIZE"));
    }
}
