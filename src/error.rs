//! Error taxonomy for the relay.
//!
//! Only `Bind`, `RemoteConnect`, `TlsConfig` and `TlsHandshake` are surfaced to
//! the controlling side as user-visible failures. Everything that happens per
//! chunk is absorbed where it occurs and only logged.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors produced by the relay engine.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The listening socket could not be bound. Fatal to relay start.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The upstream connection could not be established. Fatal to one session.
    #[error("failed to connect to remote {addr}: {reason}")]
    RemoteConnect { addr: String, reason: String },

    /// TLS material is missing, unreadable or unusable.
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    /// The TLS handshake failed or timed out.
    #[error("TLS handshake with {peer} failed: {reason}")]
    TlsHandshake { peer: SocketAddr, reason: String },

    /// A transform stage failed. Recovered inside the pipeline.
    #[error("transform stage '{stage}' failed: {reason}")]
    TransformStage { stage: String, reason: String },

    /// A session log write failed. Traffic keeps flowing.
    #[error("session log write to {} failed: {source}", path.display())]
    LogWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The peer closed its side of the connection.
    #[error("peer closed the connection")]
    PeerClosed,

    /// Any other I/O failure on a relayed connection.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Stable, label-friendly name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Bind { .. } => "bind",
            RelayError::RemoteConnect { .. } => "remote_connect",
            RelayError::TlsConfig(_) => "tls_config",
            RelayError::TlsHandshake { .. } => "tls_handshake",
            RelayError::TransformStage { .. } => "transform_stage",
            RelayError::LogWrite { .. } => "log_write",
            RelayError::PeerClosed => "peer_closed",
            RelayError::Io(_) => "io",
        }
    }

    /// Whether this error is reported to the controlling side as a failure.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            RelayError::Bind { .. }
                | RelayError::RemoteConnect { .. }
                | RelayError::TlsConfig(_)
                | RelayError::TlsHandshake { .. }
        )
    }

    pub(crate) fn tls_config(msg: impl Into<String>) -> Self {
        RelayError::TlsConfig(msg.into())
    }
}

/// Errors returned by transform stages and module construction.
#[derive(Debug, Error)]
pub enum TransformError {
    /// The stage rejected or could not process the chunk.
    #[error("{0}")]
    Failed(String),

    /// The stage panicked while processing.
    #[error("stage panicked: {0}")]
    Panicked(String),

    /// Module options were missing or malformed.
    #[error("invalid options for module '{module}': {reason}")]
    Options { module: String, reason: String },

    /// No module with this name is registered.
    #[error("unknown transform module '{0}'")]
    UnknownModule(String),
}

impl TransformError {
    /// Shorthand for a processing failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        TransformError::Failed(msg.into())
    }
}
