//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the intercepting relay.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RelayConfig {
    /// Where to listen and where to relay to.
    pub endpoint: EndpointConfig,

    /// Enabled transform modules per direction.
    pub pipeline: PipelineConfig,

    /// Per-session traffic log.
    pub session_log: SessionLogConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Resource limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Endpoint configuration. Immutable for the lifetime of a relay run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Local IP address to bind.
    pub bind_address: String,

    /// Local port to bind (0 picks an ephemeral port).
    pub bind_port: u16,

    /// Remote host name or IP address.
    pub remote_address: String,

    /// Remote port.
    pub remote_port: u16,

    /// TLS toward connecting clients (relay acts as TLS server).
    pub local_tls: TlsSideConfig,

    /// TLS toward the remote target (relay acts as TLS client).
    pub remote_tls: TlsSideConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 8080,
            remote_address: String::new(),
            remote_port: 80,
            local_tls: TlsSideConfig::default(),
            remote_tls: TlsSideConfig::default(),
        }
    }
}

impl EndpointConfig {
    /// Socket address to bind, if the configured IP parses.
    pub fn bind_socket_addr(&self) -> Option<SocketAddr> {
        self.bind_address
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.bind_port))
    }

    /// `host:port` form of the bind endpoint, for messages.
    pub fn bind_display(&self) -> String {
        join_host_port(&self.bind_address, self.bind_port)
    }

    /// `host:port` form of the remote endpoint, suitable for connecting.
    pub fn remote_display(&self) -> String {
        join_host_port(&self.remote_address, self.remote_port)
    }

    pub fn local_tls_enabled(&self) -> bool {
        self.local_tls.enabled
    }

    pub fn remote_tls_enabled(&self) -> bool {
        self.remote_tls.enabled
    }

    /// Name presented as SNI and checked against the remote certificate.
    pub fn remote_server_name(&self) -> &str {
        self.remote_tls
            .server_name
            .as_deref()
            .unwrap_or(&self.remote_address)
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// TLS settings for one side of the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSideConfig {
    /// Wrap this side in TLS.
    pub enabled: bool,

    /// Validate the peer certificate. Unset means the side's default.
    ///
    /// Server side (default off): require a client certificate signed by
    /// `client_ca_path`. Client side (default on): validate the remote chain
    /// and host name. `false` there accepts any certificate, which is
    /// insecure and meant for lab targets with self-signed certificates.
    pub verify: Option<bool>,

    /// Certificate chain (PEM). Server identity on the local side, optional
    /// client certificate on the remote side.
    pub cert_path: Option<PathBuf>,

    /// Private key (PEM). Defaults to `cert_path` for combined PEM files.
    pub key_path: Option<PathBuf>,

    /// CA bundle used to verify client certificates (local side only).
    pub client_ca_path: Option<PathBuf>,

    /// CA bundle used to verify the remote (remote side only). Falls back
    /// to the bundled web PKI roots.
    pub ca_path: Option<PathBuf>,

    /// SNI / verification name override (remote side only).
    pub server_name: Option<String>,
}

impl TlsSideConfig {
    /// Whether connecting clients must present a trusted certificate.
    pub fn verify_clients(&self) -> bool {
        self.verify.unwrap_or(false)
    }

    /// Whether the remote certificate chain and name are checked.
    pub fn verify_remote(&self) -> bool {
        self.verify.unwrap_or(true)
    }

    /// Path holding the private key.
    pub fn key_source(&self) -> Option<&PathBuf> {
        self.key_path.as_ref().or(self.cert_path.as_ref())
    }
}

/// One configured transform stage.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageConfig {
    /// Registered module name.
    pub module: String,

    /// Module-specific options.
    #[serde(default)]
    pub options: toml::Table,
}

impl StageConfig {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            options: toml::Table::new(),
        }
    }
}

/// Enabled transform modules, in order, per direction.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Stages applied to client → remote traffic.
    pub client: Vec<StageConfig>,

    /// Stages applied to remote → client traffic.
    pub server: Vec<StageConfig>,

    /// Soft time budget per stage call in milliseconds.
    pub stage_budget_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            client: Vec::new(),
            server: Vec::new(),
            stage_budget_ms: 250,
        }
    }
}

/// Rendering of chunk payloads in session logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Escaped text, one record per chunk.
    #[default]
    Text,
    /// Offset / hex / ASCII dump.
    Hex,
}

/// Per-session log settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionLogConfig {
    /// Write per-session logs.
    pub enabled: bool,

    /// Root directory; a date subdirectory is created beneath it.
    pub directory: PathBuf,

    /// Payload rendering.
    pub format: LogFormat,
}

impl Default for SessionLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: PathBuf::from("relay_logs"),
            format: LogFormat::Text,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Remote connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// TLS handshake timeout in seconds (each side).
    pub handshake_secs: u64,

    /// Close a session after this many seconds without traffic (0 = never).
    pub idle_secs: u64,

    /// How long `stop()` waits for sessions before aborting them.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 10,
            handshake_secs: 10,
            idle_secs: 0,
            drain_secs: 5,
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        (self.idle_secs > 0).then(|| Duration::from_secs(self.idle_secs))
    }

    pub fn drain(&self) -> Duration {
        Duration::from_secs(self.drain_secs)
    }
}

/// Resource limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent sessions (backpressure on accept).
    pub max_sessions: usize,

    /// Bounded read size per chunk in bytes.
    pub chunk_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            chunk_size: 4096,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Console format: "pretty" or "compact".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            [endpoint]
            remote_address = "example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.bind_address, "127.0.0.1");
        assert_eq!(config.endpoint.bind_port, 8080);
        assert_eq!(config.endpoint.remote_port, 80);
        assert!(!config.endpoint.local_tls_enabled());
        assert!(config.pipeline.client.is_empty());
        assert_eq!(config.limits.chunk_size, 4096);
        assert!(config.timeouts.idle().is_none());
    }

    #[test]
    fn full_file_parses() {
        let config: RelayConfig = toml::from_str(
            r#"
            [endpoint]
            bind_address = "0.0.0.0"
            bind_port = 8443
            remote_address = "10.1.1.5"
            remote_port = 443

            [endpoint.local_tls]
            enabled = true
            cert_path = "certs/server.pem"

            [endpoint.remote_tls]
            enabled = true
            verify = false

            [[pipeline.client]]
            module = "display"

            [[pipeline.client]]
            module = "replace"
            options = { find = "alice", replace = "mallory" }

            [[pipeline.server]]
            module = "hexdump"

            [session_log]
            format = "hex"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.remote_display(), "10.1.1.5:443");
        assert_eq!(
            config.endpoint.local_tls.key_source(),
            Some(&PathBuf::from("certs/server.pem"))
        );
        assert_eq!(config.pipeline.client.len(), 2);
        assert_eq!(config.pipeline.client[1].module, "replace");
        assert_eq!(
            config.pipeline.client[1].options.get("find").and_then(|v| v.as_str()),
            Some("alice")
        );
        assert_eq!(config.session_log.format, LogFormat::Hex);
    }

    #[test]
    fn verification_defaults_depend_on_side() {
        let config: RelayConfig = toml::from_str(
            r#"
            [endpoint.local_tls]
            enabled = true
            cert_path = "server.pem"

            [endpoint.remote_tls]
            enabled = true
            "#,
        )
        .unwrap();
        assert!(!config.endpoint.local_tls.verify_clients());
        assert!(config.endpoint.remote_tls.verify_remote());

        let insecure: TlsSideConfig = toml::from_str("enabled = true\nverify = false").unwrap();
        assert!(!insecure.verify_remote());
    }

    #[test]
    fn remote_server_name_falls_back_to_address() {
        let mut endpoint = EndpointConfig {
            remote_address: "api.example.com".into(),
            ..Default::default()
        };
        assert_eq!(endpoint.remote_server_name(), "api.example.com");

        endpoint.remote_tls.server_name = Some("sni.example.com".into());
        assert_eq!(endpoint.remote_server_name(), "sni.example.com");
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        let endpoint = EndpointConfig {
            bind_address: "::1".into(),
            bind_port: 9000,
            ..Default::default()
        };
        assert_eq!(endpoint.bind_display(), "[::1]:9000");
        assert_eq!(
            endpoint.bind_socket_addr(),
            Some("[::1]:9000".parse().unwrap())
        );
    }
}
