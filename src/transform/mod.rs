//! Transform subsystem.
//!
//! # Data Flow
//! ```text
//! PipelineConfig (enabled module names per direction)
//!     → registry.rs (name → module factory)
//!     → pipeline.rs (ordered, immutable stages per direction)
//!     → PipelineSet (one per relay run, swapped whole on reload)
//!     → every chunk of every session bound to that set
//! ```
//!
//! # Design Decisions
//! - Stages are synchronous and CPU-bound; the pipeline offers no async hooks
//! - A failing or panicking stage is a no-op for that chunk (fail-open)
//! - Observers and mutators share one contract

pub mod builtin;
pub mod pipeline;
pub mod registry;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::Serialize;

pub use crate::error::TransformError;
pub use pipeline::{Pipeline, PipelineSet};
pub use registry::ModuleRegistry;

/// Traffic direction through the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Bytes read from the client and written to the remote.
    ClientToRemote,
    /// Bytes read from the remote and written to the client.
    RemoteToClient,
}

impl Direction {
    /// Short label used in session logs.
    pub fn label(&self) -> &'static str {
        match self {
            Direction::ClientToRemote => "C->S",
            Direction::RemoteToClient => "S->C",
        }
    }

    /// Metric / field friendly name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToRemote => "client_to_remote",
            Direction::RemoteToClient => "remote_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a stage knows about the chunk it is processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageContext {
    /// Per-direction sequence number, starting at 1.
    pub message_number: u64,
    /// Which way the chunk travels.
    pub direction: Direction,
    /// Peer that sent the chunk.
    pub source: SocketAddr,
    /// Peer the chunk is forwarded to.
    pub destination: SocketAddr,
}

impl MessageContext {
    pub fn new(
        message_number: u64,
        direction: Direction,
        source: SocketAddr,
        destination: SocketAddr,
    ) -> Self {
        Self {
            message_number,
            direction,
            source,
            destination,
        }
    }

    pub fn source_address(&self) -> IpAddr {
        self.source.ip()
    }

    pub fn source_port(&self) -> u16 {
        self.source.port()
    }

    pub fn dest_address(&self) -> IpAddr {
        self.destination.ip()
    }

    pub fn dest_port(&self) -> u16 {
        self.destination.port()
    }
}

/// A pluggable processing stage.
///
/// Implementations are shared by every session of a relay run and may be
/// called concurrently, so any internal state must be synchronized by the
/// implementation itself. `process` must not perform blocking network I/O.
pub trait Transform: Send + Sync {
    /// Identity used in logs and metrics.
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Return the bytes to forward in place of `data`.
    fn process(&self, ctx: &MessageContext, data: &[u8]) -> Result<Vec<u8>, TransformError>;
}

impl fmt::Debug for dyn Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transform").field("name", &self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_exposes_call_shape() {
        let ctx = MessageContext::new(
            3,
            Direction::RemoteToClient,
            "10.0.0.2:443".parse().unwrap(),
            "127.0.0.1:51000".parse().unwrap(),
        );
        assert_eq!(ctx.source_address().to_string(), "10.0.0.2");
        assert_eq!(ctx.source_port(), 443);
        assert_eq!(ctx.dest_address().to_string(), "127.0.0.1");
        assert_eq!(ctx.dest_port(), 51000);
    }

    #[test]
    fn direction_labels() {
        assert_eq!(Direction::ClientToRemote.label(), "C->S");
        assert_eq!(Direction::RemoteToClient.to_string(), "remote_to_client");
    }
}
