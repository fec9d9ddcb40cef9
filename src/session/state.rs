//! Session state machine.
//!
//! ```text
//! PENDING → CONNECTING_REMOTE → HANDSHAKING → RELAYING → CLOSING → CLOSED
//!    └────────────┴──────────────────┴────────────┴──────────┴──→ FAILED
//! ```
//!
//! Setup states may also go straight to CLOSING when the relay is stopped.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Pending = 0,
    ConnectingRemote = 1,
    Handshaking = 2,
    Relaying = 3,
    Closing = 4,
    Closed = 5,
    Failed = 6,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Pending,
            1 => SessionState::ConnectingRemote,
            2 => SessionState::Handshaking,
            3 => SessionState::Relaying,
            4 => SessionState::Closing,
            5 => SessionState::Closed,
            _ => SessionState::Failed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Pending => "PENDING",
            SessionState::ConnectingRemote => "CONNECTING_REMOTE",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Relaying => "RELAYING",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
            SessionState::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, ConnectingRemote)
            | (ConnectingRemote, Handshaking)
            | (Handshaking, Relaying)
            | (Closing, Closed) => true,
            (Pending | ConnectingRemote | Handshaking | Relaying, Closing) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid session transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Shared, lock-free holder of a session's state.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(SessionState::Pending as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next`, returning the previous state.
    ///
    /// Exactly one caller wins any given edge; a concurrent or repeated
    /// attempt sees the already-advanced state and gets an error.
    pub fn advance(&self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current);
            if !from.can_transition_to(next) {
                return Err(InvalidTransition { from, to: next });
            }
            match self.0.compare_exchange_weak(
                current,
                next as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
