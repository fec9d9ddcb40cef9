//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RelayConfig (validated, immutable for a relay run)
//!     → shared via Arc with every session
//!
//! On file change:
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → pipeline section rebuilt and swapped into the running relay
//!     → sessions started afterwards bind the new pipeline
//! ```
//!
//! # Design Decisions
//! - Endpoint config is immutable once a run starts; only pipelines reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    EndpointConfig, LimitsConfig, LogFormat, ObservabilityConfig, PipelineConfig, RelayConfig,
    SessionLogConfig, StageConfig, TimeoutConfig, TlsSideConfig,
};
pub use validation::{validate_config, ValidationError};
pub use watcher::ConfigWatcher;
