//! Relay sessions.
//!
//! # Data Flow
//! ```text
//! accepted TCP connection
//!     → local TLS negotiation (server role, or passthrough)     PENDING
//!     → connect to remote                                       CONNECTING_REMOTE
//!     → remote TLS negotiation (client role, or passthrough)    HANDSHAKING
//!     → two pumps, one per direction                            RELAYING
//!     → first pump exit / idle timeout / stop                   CLOSING
//!     → both pumps joined, connections shut, log closed         CLOSED
//! ```
//!
//! Any setup failure ends in FAILED: the error is reported with the client
//! address and both connections are dropped before a byte is forwarded.
//!
//! # Design Decisions
//! - A session exclusively owns its connections and its logger
//! - EOF in either direction closes the whole session
//! - The pipeline set is bound once, when the session is accepted

pub mod logger;
pub mod pump;
pub mod state;

use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::net::connection::ConnectionId;
use crate::net::stream::RelayStream;
use crate::net::tls::{self, TlsRole};
use crate::observability::{metrics, EventSink, RelayEvent};
use crate::transform::{Direction, PipelineSet};

pub use logger::{LogEntry, SessionLogger, SharedLogger};
pub use pump::{ActivityClock, Pump, PumpExit, PumpReport, SequenceCounter};
pub use state::{SessionState, StateCell};

/// The endpoint 4-tuple a session is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub client: SocketAddr,
    pub remote: SocketAddr,
}

impl SessionId {
    pub fn new(client: SocketAddr, remote: SocketAddr) -> Self {
        Self { client, remote }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.client, self.remote)
    }
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    /// CLOSED or FAILED.
    pub state: SessionState,
    /// Known once the remote connection was made.
    pub session_id: Option<SessionId>,
    pub client_messages: u64,
    pub server_messages: u64,
    /// Setup error for FAILED sessions. For CLOSED sessions, what ended the
    /// relaying (`PeerClosed`, `Io`), or `None` when it was stopped.
    pub error: Option<RelayError>,
}

/// One client connection and its paired upstream connection.
pub struct Session {
    id: ConnectionId,
    client: TcpStream,
    client_addr: SocketAddr,
    config: Arc<RelayConfig>,
    pipelines: Arc<PipelineSet>,
    cancel: CancellationToken,
    state: Arc<StateCell>,
    events: EventSink,
}

impl Session {
    /// `cancel` is the session's own token; cancelling it closes the session.
    pub fn new(
        id: ConnectionId,
        client: TcpStream,
        client_addr: SocketAddr,
        config: Arc<RelayConfig>,
        pipelines: Arc<PipelineSet>,
        cancel: CancellationToken,
        events: EventSink,
    ) -> Self {
        Self {
            id,
            client,
            client_addr,
            config,
            pipelines,
            cancel,
            state: Arc::new(StateCell::new()),
            events,
        }
    }

    /// Shared view of this session's state.
    pub fn state(&self) -> Arc<StateCell> {
        Arc::clone(&self.state)
    }

    /// Drive the session to CLOSED or FAILED.
    pub async fn run(self) -> SessionOutcome {
        let Session {
            id,
            client,
            client_addr,
            config,
            pipelines,
            cancel,
            state,
            events,
        } = self;
        let ctx = SessionContext {
            id,
            client_addr,
            config,
            pipelines,
            state,
            events,
        };

        ctx.events.emit(RelayEvent::SessionOpened {
            id: id.as_u64(),
            client: client_addr,
        });

        let setup = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = ctx.setup(client) => Some(result),
        };

        match setup {
            Some(Ok((local, remote, remote_addr))) => {
                ctx.relay(local, remote, remote_addr, cancel.child_token()).await
            }
            Some(Err(error)) => ctx.fail(error),
            None => ctx.close_before_relaying(),
        }
    }
}

struct SessionContext {
    id: ConnectionId,
    client_addr: SocketAddr,
    config: Arc<RelayConfig>,
    pipelines: Arc<PipelineSet>,
    state: Arc<StateCell>,
    events: EventSink,
}

impl SessionContext {
    fn advance(&self, next: SessionState) {
        match self.state.advance(next) {
            Ok(from) => tracing::trace!(from = %from, to = %next, "Session state changed"),
            Err(e) => tracing::debug!("{}", e),
        }
    }

    /// PENDING through HANDSHAKING. Nothing is forwarded until this returns.
    async fn setup(&self, client: TcpStream) -> Result<(RelayStream, RelayStream, SocketAddr)> {
        let endpoint = &self.config.endpoint;
        let timeouts = &self.config.timeouts;

        let local = tls::negotiate(client, TlsRole::Server, &endpoint.local_tls, timeouts.handshake()).await?;
        self.advance(SessionState::ConnectingRemote);

        let remote_addr = endpoint.remote_display();
        let remote_tcp = connect_remote(&remote_addr, timeouts.connect()).await?;
        let remote_peer = remote_tcp.peer_addr().map_err(|e| RelayError::RemoteConnect {
            addr: remote_addr.clone(),
            reason: e.to_string(),
        })?;
        self.advance(SessionState::Handshaking);

        let remote = tls::negotiate(
            remote_tcp,
            TlsRole::Client {
                server_name: endpoint.remote_server_name(),
            },
            &endpoint.remote_tls,
            timeouts.handshake(),
        )
        .await?;
        self.advance(SessionState::Relaying);

        Ok((local, remote, remote_peer))
    }

    async fn relay(
        &self,
        local: RelayStream,
        remote: RelayStream,
        remote_addr: SocketAddr,
        closing: CancellationToken,
    ) -> SessionOutcome {
        let session_id = SessionId::new(self.client_addr, remote_addr);
        tracing::info!(
            session = %session_id,
            local_transport = local.transport(),
            remote_transport = remote.transport(),
            "Session relaying"
        );
        self.events.emit(RelayEvent::SessionRelaying {
            id: self.id.as_u64(),
            client: self.client_addr,
            remote: remote_addr,
        });

        let logger: SharedLogger = Arc::new(Mutex::new(SessionLogger::new(
            &self.config.session_log,
            self.client_addr,
            remote_addr,
        )));
        let activity = Arc::new(ActivityClock::new());
        let chunk_size = self.config.limits.chunk_size;

        let (client_read, client_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);

        let client_to_remote = Pump {
            direction: Direction::ClientToRemote,
            reader: client_read,
            writer: remote_write,
            source: self.client_addr,
            destination: remote_addr,
            pipelines: Arc::clone(&self.pipelines),
            logger: Arc::clone(&logger),
            chunk_size,
            closing: closing.clone(),
            activity: Arc::clone(&activity),
        };
        let remote_to_client = Pump {
            direction: Direction::RemoteToClient,
            reader: remote_read,
            writer: client_write,
            source: remote_addr,
            destination: self.client_addr,
            pipelines: Arc::clone(&self.pipelines),
            logger: Arc::clone(&logger),
            chunk_size,
            closing: closing.clone(),
            activity: Arc::clone(&activity),
        };

        let mut c2r = AbortOnDrop(tokio::spawn(client_to_remote.run()));
        let mut r2c = AbortOnDrop(tokio::spawn(remote_to_client.run()));
        let watchdog = self
            .config
            .timeouts
            .idle()
            .map(|idle| AbortOnDrop(tokio::spawn(idle_watchdog(idle, activity, closing.clone()))));

        let (first, c2r_first) = tokio::select! {
            report = &mut c2r => (report, true),
            report = &mut r2c => (report, false),
        };
        self.advance(SessionState::Closing);
        if let Ok(report) = &first {
            tracing::debug!(
                session = %session_id,
                direction = %report.direction,
                reason = %report.exit.describe(),
                "Session closing"
            );
        }
        closing.cancel();

        let second = if c2r_first { (&mut r2c).await } else { (&mut c2r).await };
        drop(watchdog);
        let (c2r_report, r2c_report) = if c2r_first { (&first, &second) } else { (&second, &first) };
        let client_messages = messages(c2r_report, Direction::ClientToRemote);
        let server_messages = messages(r2c_report, Direction::RemoteToClient);
        let cause = first.ok().and_then(|report| report.exit.into_error());

        if let Err(e) = logger.lock().await.close().await {
            metrics::record_log_write_failure();
            tracing::warn!(session = %session_id, error = %e, "Failed to close session log");
        }
        self.advance(SessionState::Closed);

        tracing::info!(
            session = %session_id,
            client_messages,
            server_messages,
            cause = cause.as_ref().map(RelayError::kind).unwrap_or("stopped"),
            "Session closed"
        );
        self.events.emit(RelayEvent::SessionClosed {
            id: self.id.as_u64(),
            client: self.client_addr,
            remote: Some(remote_addr),
            client_messages,
            server_messages,
        });

        SessionOutcome {
            state: self.state.get(),
            session_id: Some(session_id),
            client_messages,
            server_messages,
            error: cause,
        }
    }

    fn fail(&self, error: RelayError) -> SessionOutcome {
        let from = self.state.get();
        let remote = self.config.endpoint.remote_display();
        self.advance(SessionState::Failed);
        metrics::record_session_failure(error.kind());
        tracing::error!(
            client = %self.client_addr,
            remote = %remote,
            state = %from,
            kind = error.kind(),
            error = %error,
            "Session failed"
        );
        self.events.emit(RelayEvent::SessionFailed {
            id: self.id.as_u64(),
            client: self.client_addr,
            remote,
            kind: error.kind(),
            reason: error.to_string(),
        });

        SessionOutcome {
            state: self.state.get(),
            session_id: None,
            client_messages: 0,
            server_messages: 0,
            error: Some(error),
        }
    }

    /// Stopped during setup. The connections are dropped with the setup future.
    fn close_before_relaying(&self) -> SessionOutcome {
        tracing::debug!(client = %self.client_addr, state = %self.state.get(), "Session stopped during setup");
        self.advance(SessionState::Closing);
        self.advance(SessionState::Closed);
        self.events.emit(RelayEvent::SessionClosed {
            id: self.id.as_u64(),
            client: self.client_addr,
            remote: None,
            client_messages: 0,
            server_messages: 0,
        });

        SessionOutcome {
            state: self.state.get(),
            session_id: None,
            client_messages: 0,
            server_messages: 0,
            error: None,
        }
    }
}

async fn connect_remote(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| RelayError::RemoteConnect {
            addr: addr.to_string(),
            reason: format!("timed out after {:?}", timeout),
        })?
        .map_err(|e| RelayError::RemoteConnect {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    if let Err(e) = stream.set_nodelay(true) {
        tracing::trace!("Failed to set TCP_NODELAY on remote connection: {}", e);
    }
    Ok(stream)
}

fn messages(report: &std::result::Result<PumpReport, JoinError>, direction: Direction) -> u64 {
    match report {
        Ok(report) => report.messages,
        Err(e) => {
            tracing::error!(direction = %direction, "Pump task ended abnormally: {}", e);
            0
        }
    }
}

/// Closes the session once neither direction moved data for `idle`.
async fn idle_watchdog(idle: Duration, activity: Arc<ActivityClock>, closing: CancellationToken) {
    loop {
        let remaining = idle.saturating_sub(activity.idle_for());
        if remaining.is_zero() {
            tracing::info!(idle_secs = idle.as_secs(), "Session idle, closing");
            closing.cancel();
            return;
        }
        tokio::select! {
            _ = closing.cancelled() => return,
            _ = tokio::time::sleep(remaining) => {}
        }
    }
}

/// Join handle that aborts its task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Future for AbortOnDrop<T> {
    type Output = std::result::Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}
