//! Transactional outbox for the Composable Information Machine
//!
//! Events are written to an outbox table in the same database transaction as
//! the business change that caused them, then forwarded to an external
//! publish/subscribe bus once that transaction has committed. Delivery to the
//! bus is at-least-once.
//!
//! ```text
//! business tx ──▶ Publisher ──▶ outbox table ──▶ OutboxPoller ──▶ Pipeline ──▶ ForwardingHandler ──▶ Bus
//! ```

pub mod bus;
pub mod config;
pub mod database;
pub mod errors;
pub mod forwarder;
pub mod message;
pub mod middleware;
pub mod poller;
pub mod publisher;
pub mod router;
pub mod service;
pub mod state_machine;

#[cfg(any(test, feature = "test-tools"))]
pub mod test_tools;

// Re-export commonly used types
pub use bus::{Bus, BusError, InMemoryBus, NatsBus, NatsConfig};
pub use config::{OutboxConfig, StorageEngine};
pub use database::{Database, Executor, PostgresDatabase, Row, SqlValue, Statement, Transaction};
pub use errors::{DatabaseError, DeliveryError, DeliveryResult, OutboxError, OutboxResult};
pub use forwarder::ForwardingHandler;
pub use message::{Message, Metadata, OrderingToken, OutboxMessage};
pub use middleware::{handler_fn, json_handler, MessageHandler, Pipeline, RetryPolicy};
pub use poller::{OutboxPoller, PollReport};
pub use publisher::Publisher;
pub use router::{OutboxDialect, TopicRouter};
pub use service::{Lifecycle, OutboxService};
pub use state_machine::SubscriptionState;
