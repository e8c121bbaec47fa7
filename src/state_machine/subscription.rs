// Copyright (c) 2025 - Cowboy AI, Inc.
//! Outbox Subscription Lifecycle
//!
//! One instance per polled topic.
//!
//! ```text
//! Uninitialized ──Initialized──▶ Initialized ──PollStarted──▶ Polling
//!                                                               │ ▲
//!                                                   RowFetched  │ │ Resumed
//!                                                               ▼ │
//!                                  Delivering ──Acked──▶ Acknowledged
//!                                       └──────Nacked──▶ Unacknowledged
//!
//! any ──Initialized──▶ unchanged (after the first)
//! any ──Stopped──▶ Stopped (terminal)
//! ```

use std::fmt;

use super::{StateMachine, TransitionError, TransitionResult};

/// Per-topic subscription state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Uninitialized,
    /// Offset tracking exists for the topic
    Initialized,
    Polling,
    /// A row is inside the middleware pipeline
    Delivering,
    Acknowledged,
    /// The pipeline failed; the row is revisited on a later tick
    Unacknowledged,
    Stopped,
}

/// Inputs driving the subscription lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Initialized,
    PollStarted,
    RowFetched,
    Acked,
    Nacked,
    Resumed,
    Stopped,
}

impl StateMachine for SubscriptionState {
    type Input = SubscriptionEvent;

    fn transition(&self, input: &Self::Input) -> TransitionResult<Self> {
        use SubscriptionEvent as E;
        use SubscriptionState as S;

        match (self, input) {
            (S::Stopped, _) => Err(invalid(self, input)),
            (_, E::Stopped) => Ok(S::Stopped),
            (S::Uninitialized, E::Initialized) => Ok(S::Initialized),
            (S::Initialized, E::PollStarted) => Ok(S::Polling),
            (S::Polling, E::RowFetched) => Ok(S::Delivering),
            (S::Delivering, E::Acked) => Ok(S::Acknowledged),
            (S::Delivering, E::Nacked) => Ok(S::Unacknowledged),
            (S::Acknowledged | S::Unacknowledged, E::Resumed) => Ok(S::Polling),
            // Offset bootstrap is idempotent; re-running it leaves the state alone
            (live, E::Initialized) => Ok(*live),
            _ => Err(invalid(self, input)),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Stopped)
    }
}

fn invalid(from: &SubscriptionState, input: &SubscriptionEvent) -> TransitionError {
    TransitionError::InvalidTransition {
        from: from.to_string(),
        input: format!("{:?}", input),
    }
}

impl fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriptionState::Uninitialized => "uninitialized",
            SubscriptionState::Initialized => "initialized",
            SubscriptionState::Polling => "polling",
            SubscriptionState::Delivering => "delivering",
            SubscriptionState::Acknowledged => "acknowledged",
            SubscriptionState::Unacknowledged => "unacknowledged",
            SubscriptionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
