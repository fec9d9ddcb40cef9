//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Relay, sessions, pumps and pipelines produce:
//!     → logging.rs (structured diagnostics through tracing)
//!     → metrics.rs (counters and gauges, Prometheus scrape endpoint)
//!     → events.rs (status lines for the controlling side)
//! ```
//!
//! # Design Decisions
//! - Diagnostics and status events are separate streams; the session traffic
//!   log lives with the session, not here
//! - Metrics calls are no-ops until a recorder is installed

pub mod events;
pub mod logging;
pub mod metrics;

pub use events::{EventSink, RelayEvent};
