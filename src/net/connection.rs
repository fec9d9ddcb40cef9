//! Connection identity and the active-session registry.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing and status events
//! - Track every live session so stop() can broadcast and await drain
//! - Deregister sessions when their task ends, however it ends

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::observability::metrics;
use crate::session::state::{SessionState, StateCell};

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough since we only need uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct SessionEntry {
    client: SocketAddr,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    abort: Option<AbortHandle>,
}

/// Point-in-time view of one registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: ConnectionId,
    pub client: SocketAddr,
    pub state: SessionState,
}

/// Live sessions of one relay run.
///
/// The only structure sessions mutate concurrently: they register when
/// accepted and deregister when their task ends. Nothing reads session data
/// through it.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ConnectionId, SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new session. The entry lives until the returned guard drops.
    pub fn register(
        &self,
        id: ConnectionId,
        client: SocketAddr,
        cancel: CancellationToken,
        state: Arc<StateCell>,
    ) -> SessionGuard {
        self.sessions.insert(
            id,
            SessionEntry {
                client,
                cancel,
                state,
                abort: None,
            },
        );
        metrics::record_active_sessions(self.sessions.len());
        SessionGuard {
            sessions: Arc::clone(&self.sessions),
            id,
        }
    }

    /// Attach the task handle used for forced teardown.
    ///
    /// Ignored if the session already finished.
    pub fn set_abort_handle(&self, id: ConnectionId, handle: AbortHandle) {
        if let Some(mut entry) = self.sessions.get_mut(&id) {
            entry.abort = Some(handle);
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshot(&self) -> Vec<SessionSummary> {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| SessionSummary {
                id: *entry.key(),
                client: entry.client,
                state: entry.state.get(),
            })
            .collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    /// Ask every session to close.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.cancel.cancel();
        }
    }

    /// Wait until no session is registered or `timeout` elapses.
    ///
    /// Returns true if the registry drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while !self.sessions.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        true
    }

    /// Abort every remaining session task. Returns how many were aborted.
    pub fn abort_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let handle = entry.abort.clone()?;
                tracing::warn!(
                    connection_id = %entry.key(),
                    client = %entry.client,
                    state = %entry.state.get(),
                    "Session did not drain in time, aborting"
                );
                Some(handle)
            })
            .collect();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }
}

/// Deregisters a session when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    sessions: Arc<DashMap<ConnectionId, SessionEntry>>,
    id: ConnectionId,
}

impl SessionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions.remove(&self.id);
        metrics::record_active_sessions(self.sessions.len());
        tracing::trace!(connection_id = %self.id, "Session deregistered");
    }
}
