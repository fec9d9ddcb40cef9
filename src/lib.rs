//! Intercepting TCP/TLS relay library.
//!
//! Sits between a client and a real server, forwards bytes both ways and
//! runs every chunk through an ordered pipeline of pluggable transform
//! stages, recording each chunk in a per-session log.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod session;
pub mod transform;

pub use config::schema::RelayConfig;
pub use error::{RelayError, TransformError};
pub use net::{Relay, RelayHandle};
pub use observability::{EventSink, RelayEvent};
pub use transform::{Direction, MessageContext, ModuleRegistry, PipelineSet, Transform};
