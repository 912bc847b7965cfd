//! Results of driving the peer state machine
//!
//! Polling the str0m state machine yields either a deadline or something the
//! session must act on outside the state machine lock.

use std::time::Instant;

use crate::model::state::ConnectionState;

/// What one poll of the peer state machine produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagated {
    /// When we have nothing to propagate.
    Noop,

    /// A poll operation has reached its timeout.
    Timeout(Instant),

    /// The connection moved to a new state; listeners must be told.
    StateChange(ConnectionState),
}

impl Propagated {
    /// Extracts the connection state carried by the event, if any.
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            Propagated::StateChange(s) => Some(*s),
            _ => None,
        }
    }
}
