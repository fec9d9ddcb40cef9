//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use intercept_relay::config::{RelayConfig, TlsSideConfig};
use intercept_relay::net::stream::RelayStream;
use intercept_relay::net::tls::{negotiate, TlsRole};
use intercept_relay::RelayEvent;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Bytes a recording backend received, across all its connections.
pub type Recorded = Arc<Mutex<Vec<u8>>>;

/// Start a backend that echoes everything back on each connection.
pub async fn start_echo_backend() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Start a backend that records what it receives and never replies.
pub async fn start_recording_backend() -> (SocketAddr, Recorded) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let recorded: Recorded = Arc::default();
    let sink = Arc::clone(&recorded);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let sink = Arc::clone(&sink);
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => sink.lock().unwrap().extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });
    (addr, recorded)
}

/// Start a TLS echo backend presenting the certificate in `pem`.
pub async fn start_tls_echo_backend(pem: PathBuf) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tls = server_tls(pem);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tls = tls.clone();
            tokio::spawn(async move {
                let Ok(stream) = negotiate(socket, TlsRole::Server, &tls, Duration::from_secs(5)).await else {
                    return;
                };
                let (mut reader, mut writer) = tokio::io::split(stream);
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Write a self-signed `localhost` certificate and its key to one PEM file.
pub fn write_self_signed_pem(dir: &Path) -> PathBuf {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let path = dir.join("localhost.pem");
    let pem = format!("{}{}", certified.cert.pem(), certified.key_pair.serialize_pem());
    std::fs::write(&path, pem).unwrap();
    path
}

/// TLS server side with the given combined PEM, no client verification.
pub fn server_tls(pem: PathBuf) -> TlsSideConfig {
    TlsSideConfig {
        enabled: true,
        verify: Some(false),
        cert_path: Some(pem),
        ..TlsSideConfig::default()
    }
}

/// TLS client side without verification.
pub fn insecure_client_tls() -> TlsSideConfig {
    TlsSideConfig {
        enabled: true,
        verify: Some(false),
        ..TlsSideConfig::default()
    }
}

/// Connect to the relay as a TLS client.
pub async fn connect_tls(addr: SocketAddr) -> RelayStream {
    let tcp = TcpStream::connect(addr).await.unwrap();
    negotiate(
        tcp,
        TlsRole::Client {
            server_name: "localhost",
        },
        &insecure_client_tls(),
        Duration::from_secs(5),
    )
    .await
    .unwrap()
}

/// Relay config on an ephemeral local port toward `remote`.
pub fn base_config(remote: SocketAddr, log_dir: &Path) -> RelayConfig {
    let mut config = RelayConfig::default();
    config.endpoint.bind_address = "127.0.0.1".into();
    config.endpoint.bind_port = 0;
    config.endpoint.remote_address = remote.ip().to_string();
    config.endpoint.remote_port = remote.port();
    config.session_log.directory = log_dir.to_path_buf();
    config.timeouts.connect_secs = 2;
    config.timeouts.handshake_secs = 5;
    config.timeouts.drain_secs = 2;
    config
}

/// Every session log under `log_dir`, sorted.
pub fn find_log_files(log_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(dates) = std::fs::read_dir(log_dir) else {
        return files;
    };
    for date in dates.flatten() {
        if let Ok(entries) = std::fs::read_dir(date.path()) {
            files.extend(entries.flatten().map(|e| e.path()));
        }
    }
    files.sort();
    files
}

/// Header lines (`C->S #1 4 bytes` ...) of a session log, timestamps stripped.
pub fn log_headers(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|line| line.starts_with('['))
        .filter_map(|line| line.split_once("] ").map(|(_, rest)| rest.to_string()))
        .filter(|rest| rest.contains(" bytes"))
        .collect()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Receive events until one matches `pred`, failing after `timeout`.
pub async fn expect_event<F: Fn(&RelayEvent) -> bool>(
    rx: &mut mpsc::UnboundedReceiver<RelayEvent>,
    pred: F,
    timeout: Duration,
) -> RelayEvent {
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for relay event")
}

/// Send `msg` and read back exactly `expect_len` bytes.
pub async fn round_trip<S>(stream: &mut S, msg: &[u8], expect_len: usize) -> Vec<u8>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    stream.write_all(msg).await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = vec![0u8; expect_len];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timed out reading reply")
        .unwrap();
    buf
}
