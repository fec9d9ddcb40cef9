//! Intercepting relay (v1)
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────┐
//!                 │                   INTERCEPT RELAY                     │
//!                 │                                                       │
//!   Client        │  ┌─────────┐   ┌─────────┐   ┌──────────────────┐    │   Remote
//!   ──────────────┼─▶│listener │──▶│ local   │──▶│ client→remote    │────┼──▶ server
//!                 │  │ accept  │   │  TLS    │   │ pump + pipeline  │    │
//!                 │  └─────────┘   └─────────┘   └──────────────────┘    │
//!                 │                              ┌──────────────────┐    │
//!   ◀─────────────┼──────────────────────────────│ remote→client    │◀───┼─── (remote TLS)
//!                 │                              │ pump + pipeline  │    │
//!                 │                              └────────┬─────────┘    │
//!                 │                                       ▼              │
//!                 │                              per-session log file    │
//!                 │                                                       │
//!                 │  config + watcher · lifecycle · observability         │
//!                 └──────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use intercept_relay::config::{
    parse_config, validate_config, ConfigError, ConfigWatcher, RelayConfig, StageConfig,
};
use intercept_relay::lifecycle::signals;
use intercept_relay::observability::{logging, metrics};
use intercept_relay::{EventSink, ModuleRegistry, PipelineSet, Relay, RelayEvent};

#[derive(Parser, Debug)]
#[command(name = "intercept-relay")]
#[command(about = "Intercepting TCP/TLS relay with pluggable transform modules", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Local address to listen on (IP:PORT)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Remote target (HOST:PORT)
    #[arg(long)]
    remote: Option<String>,

    /// Accept TLS from clients
    #[arg(long)]
    local_tls: bool,

    /// Connect to the remote with TLS
    #[arg(long)]
    remote_tls: bool,

    /// Accept any remote certificate and skip client verification (remote
    /// certificates are verified by default)
    #[arg(long)]
    insecure: bool,

    /// Module for client→remote traffic, in order (repeatable)
    #[arg(long = "client-module", value_name = "NAME")]
    client_modules: Vec<String>,

    /// Module for remote→client traffic, in order (repeatable)
    #[arg(long = "server-module", value_name = "NAME")]
    server_modules: Vec<String>,

    /// Reload the pipeline when the config file changes
    #[arg(long)]
    watch: bool,

    /// Print status events as JSON lines on stdout
    #[arg(long)]
    json_events: bool,

    /// List available modules and exit
    #[arg(long)]
    list_modules: bool,
}

impl Cli {
    /// Flags win over the file.
    fn apply_overrides(&self, config: &mut RelayConfig) -> Result<(), String> {
        if let Some(bind) = self.bind {
            config.endpoint.bind_address = bind.ip().to_string();
            config.endpoint.bind_port = bind.port();
        }
        if let Some(remote) = &self.remote {
            let (host, port) = split_host_port(remote)?;
            config.endpoint.remote_address = host;
            config.endpoint.remote_port = port;
        }
        if self.local_tls {
            config.endpoint.local_tls.enabled = true;
        }
        if self.remote_tls {
            config.endpoint.remote_tls.enabled = true;
        }
        if self.insecure {
            config.endpoint.local_tls.verify = Some(false);
            config.endpoint.remote_tls.verify = Some(false);
        }
        if !self.client_modules.is_empty() {
            config.pipeline.client = self.client_modules.iter().map(StageConfig::new).collect();
        }
        if !self.server_modules.is_empty() {
            config.pipeline.server = self.server_modules.iter().map(StageConfig::new).collect();
        }
        Ok(())
    }
}

fn split_host_port(value: &str) -> Result<(String, u16), String> {
    let (host, port) = value
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' is not HOST:PORT", value))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| format!("invalid port in '{}': {}", value, e))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(format!("missing host in '{}'", value));
    }
    Ok((host.to_string(), port))
}

fn load(cli: &Cli, modules: &ModuleRegistry) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => parse_config(&std::fs::read_to_string(path).map_err(ConfigError::Io)?)?,
        None => RelayConfig::default(),
    };
    cli.apply_overrides(&mut config)?;
    validate_config(&config, modules).map_err(ConfigError::Validation)?;
    Ok(config)
}

async fn next_update(rx: &mut Option<mpsc::UnboundedReceiver<RelayConfig>>) -> Option<RelayConfig> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let modules = Arc::new(ModuleRegistry::with_builtins());

    if cli.list_modules {
        for (name, description) in modules.modules() {
            println!("{} - {}", name, description);
        }
        return Ok(());
    }

    let config = load(&cli, &modules)?;
    logging::init_logging(&config.observability);
    tracing::info!("intercept-relay v{} starting", env!("CARGO_PKG_VERSION"));

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let pipelines = PipelineSet::from_config(&config.pipeline, &modules)?;
    for stage in config.pipeline.client.iter().chain(config.pipeline.server.iter()) {
        tracing::debug!(module = %stage.module, "Module enabled");
    }

    let (events, mut event_rx) = EventSink::channel();
    let json_events = cli.json_events;
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event, json_events);
        }
    });

    let relay = Relay::start(config, pipelines, events).await?;

    // The watcher must stay alive for updates to arrive.
    let mut updates = None;
    let _watcher = match (&cli.config, cli.watch) {
        (Some(path), true) => {
            let (watcher, rx) = ConfigWatcher::new(path, Arc::clone(&modules));
            updates = Some(rx);
            Some(watcher.run()?)
        }
        (None, true) => {
            tracing::warn!("--watch needs --config, ignoring");
            None
        }
        _ => None,
    };

    let stop_signal = signals::wait_for_signal();
    tokio::pin!(stop_signal);
    loop {
        tokio::select! {
            _ = &mut stop_signal => break,
            update = next_update(&mut updates) => match update {
                Some(mut update) => {
                    if let Err(e) = cli.apply_overrides(&mut update) {
                        tracing::error!("Ignoring reloaded config: {}", e);
                        continue;
                    }
                    if let Err(e) = relay.apply_config_update(&update, &modules) {
                        tracing::error!("Failed to rebuild pipeline, keeping current one: {}", e);
                    }
                }
                None => updates = None,
            },
        }
    }

    tokio::select! {
        _ = relay.stop() => {}
        _ = signals::wait_for_signal() => tracing::warn!("Second signal received, exiting without drain"),
    }

    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn print_event(event: &RelayEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("Failed to encode event: {}", e),
        }
    } else {
        tracing::info!(target: "intercept_relay::status", "{}", event);
    }
}
