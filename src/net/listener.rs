//! TCP listener and the relay accept loop.
//!
//! # Responsibilities
//! - Bind the configured local address (failure is fatal to start)
//! - Accept connections, bounded by `max_sessions` via a semaphore
//! - Spawn one session per connection and track it in the registry
//! - Stop: stop accepting, release the port, drain sessions, abort stragglers

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::{EndpointConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::lifecycle::Shutdown;
use crate::net::connection::{ConnectionId, SessionRegistry, SessionSummary};
use crate::observability::{metrics, EventSink, RelayEvent};
use crate::session::Session;
use crate::transform::{Direction, ModuleRegistry, PipelineSet, TransformError};

/// A bounded TCP listener that limits concurrent sessions.
///
/// Uses a semaphore to enforce `max_sessions`. When the limit is reached,
/// new connections wait in the kernel backlog until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    session_limit: Arc<Semaphore>,
    max_sessions: usize,
}

impl Listener {
    /// Bind to the configured endpoint.
    pub async fn bind(endpoint: &EndpointConfig, max_sessions: usize) -> Result<Self> {
        let display = endpoint.bind_display();
        let addr = endpoint.bind_socket_addr().ok_or_else(|| RelayError::Bind {
            addr: display.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"),
        })?;

        let listener = TcpListener::bind(addr).await.map_err(|source| RelayError::Bind {
            addr: display.clone(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: display,
            source,
        })?;

        tracing::info!(address = %local_addr, max_sessions, "Listener bound");

        Ok(Self {
            inner: listener,
            session_limit: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
        })
    }

    /// Accept a new connection, respecting the session limit.
    ///
    /// The returned permit must be held for the session's lifetime.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr, SessionPermit)> {
        let permit = Arc::clone(&self.session_limit)
            .acquire_owned()
            .await
            .map_err(|_| io::Error::other("session limit semaphore closed"))?;

        let (stream, addr) = self.inner.accept().await?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.session_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, SessionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.session_limit.available_permits()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }
}

/// A session slot. Released when dropped, even if the session task panics.
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Entry point of a relay run.
pub struct Relay;

impl Relay {
    /// Bind and start accepting.
    ///
    /// Fails with `RelayError::Bind` without ever running the accept loop if
    /// the local address is unavailable.
    pub async fn start(
        config: RelayConfig,
        pipelines: PipelineSet,
        events: EventSink,
    ) -> Result<RelayHandle> {
        let listener = Listener::bind(&config.endpoint, config.limits.max_sessions).await?;
        let local_addr = listener.local_addr().map_err(|source| RelayError::Bind {
            addr: config.endpoint.bind_display(),
            source,
        })?;

        let run_id = Uuid::new_v4();
        let config = Arc::new(config);
        let pipelines = Arc::new(ArcSwap::from_pointee(pipelines));
        let registry = SessionRegistry::new();
        let shutdown = Shutdown::new();

        let acceptor = Acceptor {
            listener,
            config: Arc::clone(&config),
            pipelines: Arc::clone(&pipelines),
            registry: registry.clone(),
            shutdown: shutdown.clone(),
            events: events.clone(),
        };
        let span = tracing::info_span!("relay", run_id = %run_id);
        let accept_task = tokio::spawn(acceptor.run().instrument(span));

        tracing::info!(
            run_id = %run_id,
            address = %local_addr,
            remote = %config.endpoint.remote_display(),
            local_tls = config.endpoint.local_tls_enabled(),
            remote_tls = config.endpoint.remote_tls_enabled(),
            "Relay started"
        );
        events.emit(RelayEvent::Listening { addr: local_addr });

        Ok(RelayHandle {
            run_id,
            local_addr,
            config,
            pipelines,
            registry,
            shutdown,
            accept_task: Some(accept_task),
            events,
        })
    }
}

struct Acceptor {
    listener: Listener,
    config: Arc<RelayConfig>,
    pipelines: Arc<ArcSwap<PipelineSet>>,
    registry: SessionRegistry,
    shutdown: Shutdown,
    events: EventSink,
}

impl Acceptor {
    async fn run(self) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.triggered() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer, permit)) => self.spawn_session(stream, peer, permit),
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    tokio::select! {
                        _ = self.shutdown.triggered() => break,
                        _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    }
                }
            }
        }
        tracing::info!("Listener stopped accepting");
    }

    fn spawn_session(&self, stream: TcpStream, peer: SocketAddr, permit: SessionPermit) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::trace!(peer = %peer, "Failed to set TCP_NODELAY: {}", e);
        }

        let id = ConnectionId::new();
        let token = self.shutdown.subscribe();
        let session = Session::new(
            id,
            stream,
            peer,
            Arc::clone(&self.config),
            self.pipelines.load_full(),
            token.clone(),
            self.events.clone(),
        );
        let guard = self.registry.register(id, peer, token, session.state());
        metrics::record_session_opened();

        let span = tracing::info_span!("session", id = %id, client = %peer);
        let task = tokio::spawn(
            async move {
                let _permit = permit;
                let _guard = guard;
                session.run().await;
            }
            .instrument(span),
        );
        self.registry.set_abort_handle(id, task.abort_handle());
    }
}

/// Control surface of a running relay.
pub struct RelayHandle {
    run_id: Uuid,
    local_addr: SocketAddr,
    config: Arc<RelayConfig>,
    pipelines: Arc<ArcSwap<PipelineSet>>,
    registry: SessionRegistry,
    shutdown: Shutdown,
    accept_task: Option<JoinHandle<()>>,
    events: EventSink,
}

impl RelayHandle {
    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.registry.active_count()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.registry.snapshot()
    }

    /// The pipeline set new sessions bind.
    pub fn pipelines(&self) -> Arc<PipelineSet> {
        self.pipelines.load_full()
    }

    /// Swap in a new pipeline set. Sessions already running keep theirs.
    pub fn reload_pipelines(&self, pipelines: PipelineSet) {
        let client_stages = pipelines.for_direction(Direction::ClientToRemote).stage_names();
        let server_stages = pipelines.for_direction(Direction::RemoteToClient).stage_names();
        self.pipelines.store(Arc::new(pipelines));

        tracing::info!(
            client_stages = ?client_stages,
            server_stages = ?server_stages,
            "Pipeline reloaded"
        );
        self.events.emit(RelayEvent::PipelineReloaded {
            client_stages,
            server_stages,
        });
    }

    /// Apply a reloaded config file: only the pipeline section takes effect.
    pub fn apply_config_update(
        &self,
        update: &RelayConfig,
        modules: &ModuleRegistry,
    ) -> std::result::Result<(), TransformError> {
        if update.endpoint != self.config.endpoint {
            tracing::warn!("Endpoint changes require a restart and were ignored");
        }
        let pipelines = PipelineSet::from_config(&update.pipeline, modules)?;
        self.reload_pipelines(pipelines);
        Ok(())
    }

    /// Stop accepting and ask every session to close, without waiting.
    pub fn trigger_stop(&self) {
        self.shutdown.trigger();
        self.registry.cancel_all();
    }

    pub fn is_stopping(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Stop the relay and wait for every session to finish teardown.
    ///
    /// Sessions still running after `timeouts.drain_secs` are aborted.
    pub async fn stop(mut self) {
        self.trigger_stop();

        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                tracing::error!("Accept loop ended abnormally: {}", e);
            }
        }
        // Sessions accepted just before the loop exited got a cancelled token
        // already, since their tokens are children of the shutdown token.
        self.registry.cancel_all();

        let drain = self.config.timeouts.drain();
        let active = self.registry.active_count();
        if active > 0 {
            tracing::info!(active, drain_secs = drain.as_secs(), "Draining sessions");
        }
        if !self.registry.wait_for_drain(drain).await {
            let aborted = self.registry.abort_all();
            tracing::warn!(aborted, "Drain timeout reached, sessions aborted");
            self.registry.wait_for_drain(Duration::from_secs(1)).await;
        }

        tracing::info!(run_id = %self.run_id, "Relay stopped");
        self.events.emit(RelayEvent::Stopped);
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("run_id", &self.run_id)
            .field("local_addr", &self.local_addr)
            .field("active_sessions", &self.registry.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;

    fn config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.endpoint.bind_port = 0;
        config.endpoint.remote_address = "127.0.0.1".into();
        config.endpoint.remote_port = 9;
        config.session_log.enabled = false;
        config
    }

    #[tokio::test]
    async fn bind_in_use_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = config();
        config.endpoint.bind_port = taken.local_addr().unwrap().port();

        let err = Relay::start(config, PipelineSet::empty(), EventSink::disabled())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "bind");
    }

    #[tokio::test]
    async fn invalid_bind_address_is_fatal() {
        let mut config = config();
        config.endpoint.bind_address = "not-an-ip".into();
        let err = Listener::bind(&config.endpoint, 1).await.err().unwrap();
        assert!(matches!(err, RelayError::Bind { .. }));
    }

    #[tokio::test]
    async fn stop_releases_the_port() {
        let (events, mut rx) = EventSink::channel();
        let relay = Relay::start(config(), PipelineSet::empty(), events).await.unwrap();
        let addr = relay.local_addr();
        assert_eq!(rx.recv().await, Some(RelayEvent::Listening { addr }));

        relay.stop().await;
        assert_eq!(rx.recv().await, Some(RelayEvent::Stopped));

        let rebound = std::net::TcpListener::bind(addr);
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn reload_swaps_pipeline_for_new_sessions() {
        let (events, mut rx) = EventSink::channel();
        let relay = Relay::start(config(), PipelineSet::empty(), events).await.unwrap();
        let _ = rx.recv().await;
        let before = relay.pipelines();

        let mut update = config();
        update.endpoint.remote_port = 10;
        update.pipeline.client.push(StageConfig::new("uppercase"));
        relay
            .apply_config_update(&update, &ModuleRegistry::with_builtins())
            .unwrap();

        assert!(before.for_direction(Direction::ClientToRemote).is_empty());
        assert_eq!(
            relay.pipelines().for_direction(Direction::ClientToRemote).stage_names(),
            vec!["uppercase"]
        );
        assert_eq!(relay.config().endpoint.remote_port, 9);
        assert!(matches!(rx.recv().await, Some(RelayEvent::PipelineReloaded { .. })));

        let mut bad = config();
        bad.pipeline.server.push(StageConfig::new("nope"));
        assert!(relay.apply_config_update(&bad, &ModuleRegistry::with_builtins()).is_err());
        assert_eq!(
            relay.pipelines().for_direction(Direction::ClientToRemote).stage_names(),
            vec!["uppercase"]
        );

        relay.stop().await;
    }
}
