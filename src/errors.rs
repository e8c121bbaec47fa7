// Copyright (c) 2025 - Cowboy AI, Inc.
//! Error types for outbox operations
//!
//! The taxonomy separates failures by who has to react to them:
//!
//! - [`OutboxError::Configuration`] aborts startup
//! - [`OutboxError::UnroutedTopic`] is returned to the publishing caller so it can
//!   roll back its own transaction
//! - [`DeliveryError`] stays inside the delivery pipeline; the row remains
//!   unacknowledged and is revisited on a later poll tick

use thiserror::Error;

use crate::bus::BusError;
use crate::state_machine::TransitionError;

/// Errors raised by the outbox publisher, poller and service
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Invalid topic/table mapping or option value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Publish to a topic that has no outbox table
    #[error("No outbox table configured for topic '{0}'")]
    UnroutedTopic(String),

    /// A single publish call exceeds the bind parameter limit of the engine
    #[error("Batch of {count} messages exceeds the limit of {limit} per statement")]
    BatchTooLarge { count: usize, limit: usize },

    /// Database executor failure
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// External bus failure outside of message delivery
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Subscription lifecycle violated
    #[error("Subscription state error: {0}")]
    State(#[from] TransitionError),

    /// `run` was called on a service that is already running or has stopped
    #[error("Outbox service is already running")]
    AlreadyRunning,

    /// The service has shut down and takes no new subscriptions
    #[error("Outbox service has stopped")]
    Stopped,
}

/// Result type for outbox operations
pub type OutboxResult<T> = Result<T, OutboxError>;

impl From<serde_json::Error> for OutboxError {
    fn from(err: serde_json::Error) -> Self {
        OutboxError::Serialization(err.to_string())
    }
}

/// Errors raised by a database executor
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("sqlx: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Column missing or of an unexpected type
    #[error("Decode error: {0}")]
    Decode(String),

    /// The transaction was already committed or rolled back
    #[error("Transaction already closed")]
    TransactionClosed,

    /// Failure injected by a test executor
    #[error("Injected failure: {0}")]
    Injected(String),
}

/// Result type for database operations
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Failures surfaced by a message handler or by the pipeline around it
///
/// Every variant leaves the message unacknowledged. Messages that must not
/// be retried are acknowledged by returning `Ok(())` instead.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Business handler returned an error
    #[error("Handler failed: {0}")]
    Handler(String),

    /// Payload could not be decoded into the handler's type
    #[error("Payload decode failed: {0}")]
    Payload(String),

    /// The external bus rejected the message
    #[error(transparent)]
    Bus(#[from] BusError),

    /// The handler panicked and the fault was caught
    #[error("Handler panicked: {0}")]
    RecoveredFault(String),

    /// Every retry attempt failed
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<DeliveryError>,
    },

    /// Shutdown interrupted the backoff between attempts
    #[error("Delivery cancelled: {last}")]
    Cancelled { last: Box<DeliveryError> },
}

impl DeliveryError {
    /// Wrap any displayable error as a handler failure
    pub fn handler(err: impl std::fmt::Display) -> Self {
        DeliveryError::Handler(err.to_string())
    }

    /// The innermost cause, skipping retry and cancellation wrappers
    pub fn root_cause(&self) -> &DeliveryError {
        match self {
            DeliveryError::RetriesExhausted { last, .. } | DeliveryError::Cancelled { last } => {
                last.root_cause()
            }
            other => other,
        }
    }
}

/// Result of delivering one message
pub type DeliveryResult = Result<(), DeliveryError>;
