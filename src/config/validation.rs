//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (ports, chunk size, timeouts)
//! - Check that TLS sides name the material they need
//! - Check that every pipeline stage names a registered module
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function over the config and the module registry
//! - Certificate files are not opened here; they are read at negotiation time

use std::fmt;
use std::net::IpAddr;

use crate::config::schema::RelayConfig;
use crate::transform::ModuleRegistry;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidBindAddress(String),
    MissingRemoteAddress,
    InvalidRemotePort,
    ZeroChunkSize,
    ZeroMaxSessions,
    ZeroTimeout(&'static str),
    MissingServerCertificate,
    MissingClientCa,
    UnknownModule { direction: &'static str, module: String },
    InvalidMetricsAddress(String),
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::InvalidBindAddress(addr) => {
                write!(f, "endpoint.bind_address '{}' is not an IP address", addr)
            }
            ValidationError::MissingRemoteAddress => write!(f, "endpoint.remote_address is required"),
            ValidationError::InvalidRemotePort => write!(f, "endpoint.remote_port must be non-zero"),
            ValidationError::ZeroChunkSize => write!(f, "limits.chunk_size must be greater than zero"),
            ValidationError::ZeroMaxSessions => write!(f, "limits.max_sessions must be greater than zero"),
            ValidationError::ZeroTimeout(field) => {
                write!(f, "timeouts.{} must be greater than zero", field)
            }
            ValidationError::MissingServerCertificate => {
                write!(f, "endpoint.local_tls is enabled but cert_path is not set")
            }
            ValidationError::MissingClientCa => {
                write!(f, "endpoint.local_tls.verify requires client_ca_path")
            }
            ValidationError::UnknownModule { direction, module } => {
                write!(f, "pipeline.{}: unknown module '{}'", direction, module)
            }
            ValidationError::InvalidMetricsAddress(addr) => {
                write!(f, "observability.metrics_address '{}' is not a socket address", addr)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Validate a configuration against the set of available modules.
pub fn validate_config(
    config: &RelayConfig,
    registry: &ModuleRegistry,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();
    let endpoint = &config.endpoint;

    if endpoint.bind_address.parse::<IpAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(endpoint.bind_address.clone()));
    }
    if endpoint.remote_address.trim().is_empty() {
        errors.push(ValidationError::MissingRemoteAddress);
    }
    if endpoint.remote_port == 0 {
        errors.push(ValidationError::InvalidRemotePort);
    }
    if endpoint.local_tls.enabled {
        if endpoint.local_tls.cert_path.is_none() {
            errors.push(ValidationError::MissingServerCertificate);
        }
        if endpoint.local_tls.verify_clients() && endpoint.local_tls.client_ca_path.is_none() {
            errors.push(ValidationError::MissingClientCa);
        }
    }

    if config.limits.chunk_size == 0 {
        errors.push(ValidationError::ZeroChunkSize);
    }
    if config.limits.max_sessions == 0 {
        errors.push(ValidationError::ZeroMaxSessions);
    }

    // idle_secs = 0 means "no idle timeout" and is allowed.
    let timeouts = &config.timeouts;
    for (field, secs) in [
        ("connect_secs", timeouts.connect_secs),
        ("handshake_secs", timeouts.handshake_secs),
        ("drain_secs", timeouts.drain_secs),
    ] {
        if secs == 0 {
            errors.push(ValidationError::ZeroTimeout(field));
        }
    }

    for (direction, stages) in [
        ("client", &config.pipeline.client),
        ("server", &config.pipeline.server),
    ] {
        for stage in stages {
            if !registry.contains(&stage.module) {
                errors.push(ValidationError::UnknownModule {
                    direction,
                    module: stage.module.clone(),
                });
            }
        }
    }

    if config.observability.metrics_enabled
        && config
            .observability
            .metrics_address
            .parse::<std::net::SocketAddr>()
            .is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
