//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, session limit)
//!     → connection.rs (connection id, active-session registry)
//!     → session (local TLS via tls.rs, remote connect, remote TLS via tls.rs)
//!     → stream.rs (plain or TLS, one type for the pumps)
//! ```
//!
//! # Design Decisions
//! - Bounded accept prevents resource exhaustion
//! - Each session tracked for broadcast stop and drain
//! - TLS is negotiated per side and independently of the other side

pub mod connection;
pub mod listener;
pub mod stream;
pub mod tls;

pub use connection::{ConnectionId, SessionRegistry};
pub use listener::{Listener, Relay, RelayHandle};
pub use stream::RelayStream;
