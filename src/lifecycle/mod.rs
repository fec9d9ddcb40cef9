//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     stop() or signal → cancel token → accept loop exits
//!     → every session token cancelled → sessions drain → relay stopped
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger graceful stop
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accepting, drain sessions, abort stragglers
//! - Shutdown has a timeout: sessions left after the drain deadline are aborted

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
