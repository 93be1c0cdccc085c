//! Per-connection protocol state.
//!
//! ```text
//! Connected --EncryptionKeyReceived--> Ready
//! Ready     --QueryReceived----------> Computing
//! Computing --ChunkResultDelivered---> Computed
//! Computing --CancelQuery------------> Ready
//! Computed  --CancelQuery | ResultDelivered--> Ready
//! ```
//!
//! Any other event leaves the state unchanged. States are ordered, and a
//! request is admitted when the connection has reached at least the state
//! the request needs.

use tracing::trace;

use crate::{Result, SsesError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Connected,
    Ready,
    Computing,
    Computed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Connected => "Connected",
            State::Ready => "Ready",
            State::Computing => "Computing",
            State::Computed => "Computed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    EncryptionKeyReceived,
    QueryReceived,
    ChunkResultDelivered,
    CancelQuery,
    ResultDelivered,
}

impl State {
    /// Successor of `self` under `event`, if the table has an edge for it.
    #[must_use]
    pub fn on(self, event: Event) -> Option<State> {
        match (self, event) {
            (State::Connected, Event::EncryptionKeyReceived) => Some(State::Ready),
            (State::Ready, Event::QueryReceived) => Some(State::Computing),
            (State::Computing, Event::ChunkResultDelivered) => Some(State::Computed),
            (State::Computing, Event::CancelQuery)
            | (State::Computed, Event::CancelQuery | Event::ResultDelivered) => Some(State::Ready),
            _ => None,
        }
    }
}

/// State machine owned by one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateContext {
    current: State,
}

impl Default for StateContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StateContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: State::Connected,
        }
    }

    #[must_use]
    pub fn current(&self) -> State {
        self.current
    }

    /// Apply `event`; events without an edge are ignored.
    pub fn set(&mut self, event: Event) -> State {
        if let Some(next) = self.current.on(event) {
            trace!(from = %self.current, to = %next, ?event, "State transition");
            self.current = next;
        } else {
            trace!(state = %self.current, ?event, "Event ignored");
        }
        self.current
    }

    /// Admit a request that needs at least `min`.
    ///
    /// # Errors
    /// Returns `SsesError::ProtocolViolation` naming both states otherwise.
    pub fn require(&self, min: State, request: &str) -> Result<()> {
        if self.current >= min {
            Ok(())
        } else {
            Err(SsesError::ProtocolViolation(format!(
                "{request} needs state {min} or later, connection is {}",
                self.current
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [State; 4] = [
        State::Connected,
        State::Ready,
        State::Computing,
        State::Computed,
    ];
    const EVENTS: [Event; 5] = [
        Event::EncryptionKeyReceived,
        Event::QueryReceived,
        Event::ChunkResultDelivered,
        Event::CancelQuery,
        Event::ResultDelivered,
    ];

    #[test]
    fn test_full_session() {
        let mut sc = StateContext::new();
        assert_eq!(sc.set(Event::EncryptionKeyReceived), State::Ready);
        assert_eq!(sc.set(Event::QueryReceived), State::Computing);
        assert_eq!(sc.set(Event::ChunkResultDelivered), State::Computed);
        assert_eq!(sc.set(Event::ResultDelivered), State::Ready);
    }

    #[test]
    fn test_cancel_returns_to_ready() {
        let mut sc = StateContext::new();
        sc.set(Event::EncryptionKeyReceived);
        sc.set(Event::QueryReceived);
        assert_eq!(sc.set(Event::CancelQuery), State::Ready);

        sc.set(Event::QueryReceived);
        sc.set(Event::ChunkResultDelivered);
        assert_eq!(sc.set(Event::CancelQuery), State::Ready);
    }

    #[test]
    fn test_unlisted_events_are_noops() {
        let edges = [
            (State::Connected, Event::EncryptionKeyReceived, State::Ready),
            (State::Ready, Event::QueryReceived, State::Computing),
            (State::Computing, Event::ChunkResultDelivered, State::Computed),
            (State::Computing, Event::CancelQuery, State::Ready),
            (State::Computed, Event::CancelQuery, State::Ready),
            (State::Computed, Event::ResultDelivered, State::Ready),
        ];
        for state in STATES {
            for event in EVENTS {
                let expected = edges
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, next)| *next);
                assert_eq!(state.on(event), expected, "{state} on {event:?}");

                let mut sc = StateContext { current: state };
                let after = sc.set(event);
                assert_eq!(after, expected.unwrap_or(state));
            }
        }
    }

    #[test]
    fn test_require_is_ordered() {
        let mut sc = StateContext::new();
        assert!(sc.require(State::Connected, "keys").is_ok());
        assert!(matches!(
            sc.require(State::Ready, "query"),
            Err(SsesError::ProtocolViolation(_))
        ));
        sc.set(Event::EncryptionKeyReceived);
        sc.set(Event::QueryReceived);
        assert!(sc.require(State::Ready, "cancel").is_ok());
        assert!(sc.require(State::Computing, "chunk result").is_ok());
        assert!(sc.require(State::Computed, "result").is_err());
        assert_eq!(sc.current(), State::Computing);
    }
}
