//! Per-session traffic log.
//!
//! One append-only file per session at
//! `{directory}/{MM-DD-YYYY}/{client_ip}-{client_port}-{remote_ip}-{remote_port}.log`,
//! opened lazily on the first record. Each record is a header line, the
//! payload as escaped text or a hex dump, and a blank line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, SecondsFormat};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::{LogFormat, SessionLogConfig};
use crate::error::{RelayError, Result};
use crate::transform::builtin::{escape_bytes, hex_dump};
use crate::transform::Direction;

/// The logger as shared by the two pumps of one session.
pub type SharedLogger = Arc<Mutex<SessionLogger>>;

/// One chunk as it is written to the log.
#[derive(Debug, Clone, Copy)]
pub struct LogEntry<'a> {
    pub direction: Direction,
    pub message_number: u64,
    pub data: &'a [u8],
    /// False when the write to the destination peer failed.
    pub delivered: bool,
}

#[derive(Debug)]
pub struct SessionLogger {
    enabled: bool,
    format: LogFormat,
    directory: PathBuf,
    file_name: String,
    path: Option<PathBuf>,
    file: Option<File>,
    closed: bool,
    records: u64,
}

impl SessionLogger {
    pub fn new(config: &SessionLogConfig, client: SocketAddr, remote: SocketAddr) -> Self {
        Self {
            enabled: config.enabled,
            format: config.format,
            directory: config.directory.clone(),
            file_name: log_file_name(client, remote),
            path: None,
            file: None,
            closed: false,
            records: 0,
        }
    }

    /// A logger that records nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            format: LogFormat::Text,
            directory: PathBuf::new(),
            file_name: String::new(),
            path: None,
            file: None,
            closed: false,
            records: 0,
        }
    }

    /// Path of the log file, once it has been opened.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Records successfully written so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Append one record and flush it.
    ///
    /// Recording after `close()` is a no-op.
    pub async fn record(&mut self, entry: &LogEntry<'_>) -> Result<()> {
        if !self.enabled || self.closed {
            return Ok(());
        }

        let text = render(self.format, entry);
        let path = self.open().await?;
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Ok(()),
        };
        write_flush(file, text.as_bytes())
            .await
            .map_err(|source| RelayError::LogWrite { path, source })?;
        self.records += 1;
        Ok(())
    }

    /// Write the closing line, flush and release the file.
    ///
    /// Safe to call any number of times.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        let line = format!("[{}] session closed after {} records\n", timestamp(), self.records);
        let result = write_flush(&mut file, line.as_bytes()).await;
        drop(file);

        result.map_err(|source| RelayError::LogWrite {
            path: self.path.clone().unwrap_or_default(),
            source,
        })
    }

    async fn open(&mut self) -> Result<PathBuf> {
        if let (Some(path), Some(_)) = (&self.path, &self.file) {
            return Ok(path.clone());
        }

        let dir = self.directory.join(Local::now().format("%m-%d-%Y").to_string());
        let path = dir.join(&self.file_name);

        fs::create_dir_all(&dir)
            .await
            .map_err(|source| RelayError::LogWrite {
                path: dir.clone(),
                source,
            })?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| RelayError::LogWrite {
                path: path.clone(),
                source,
            })?;

        tracing::debug!(path = %path.display(), "Session log opened");
        self.path = Some(path.clone());
        self.file = Some(file);
        Ok(path)
    }
}

async fn write_flush(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.flush().await
}

/// `{client_ip}-{client_port}-{remote_ip}-{remote_port}.log`, with IPv6 colons
/// replaced so the name is portable.
fn log_file_name(client: SocketAddr, remote: SocketAddr) -> String {
    format!(
        "{}-{}-{}-{}.log",
        client.ip(),
        client.port(),
        remote.ip(),
        remote.port()
    )
    .replace(':', "_")
}

fn timestamp() -> String {
    Local::now().to_rfc3339_opts(SecondsFormat::Millis, false)
}

fn render(format: LogFormat, entry: &LogEntry<'_>) -> String {
    let mut out = format!(
        "[{}] {} #{} {} bytes",
        timestamp(),
        entry.direction.label(),
        entry.message_number,
        entry.data.len()
    );
    if !entry.delivered {
        out.push_str(" (not delivered)");
    }
    out.push('\n');
    match format {
        LogFormat::Text => {
            out.push_str(&escape_bytes(entry.data));
            out.push('\n');
        }
        LogFormat::Hex => out.push_str(&hex_dump(entry.data)),
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path, format: LogFormat) -> SessionLogConfig {
        SessionLogConfig {
            enabled: true,
            directory: dir.to_path_buf(),
            format,
        }
    }

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:50123".parse().unwrap(),
            "10.0.0.5:8443".parse().unwrap(),
        )
    }

    fn entry(direction: Direction, n: u64, data: &[u8]) -> LogEntry<'_> {
        LogEntry {
            direction,
            message_number: n,
            data,
            delivered: true,
        }
    }

    #[tokio::test]
    async fn file_is_opened_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let (client, remote) = addrs();
        let mut logger = SessionLogger::new(&config(dir.path(), LogFormat::Text), client, remote);

        assert!(logger.path().is_none());
        logger.close().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn records_land_in_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let (client, remote) = addrs();
        let mut logger = SessionLogger::new(&config(dir.path(), LogFormat::Text), client, remote);

        logger
            .record(&entry(Direction::ClientToRemote, 1, b"PING\r\n"))
            .await
            .unwrap();
        logger
            .record(&entry(Direction::RemoteToClient, 1, b"PONG"))
            .await
            .unwrap();

        let path = logger.path().unwrap().to_path_buf();
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "127.0.0.1-50123-10.0.0.5-8443.log"
        );
        let date_dir = path.parent().unwrap().file_name().unwrap().to_str().unwrap();
        assert_eq!(date_dir, Local::now().format("%m-%d-%Y").to_string());

        logger.close().await.unwrap();
        logger.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].ends_with("] C->S #1 6 bytes"));
        assert_eq!(lines[1], "PING\\r\\n");
        assert_eq!(lines[2], "");
        assert!(lines[3].ends_with("] S->C #1 4 bytes"));
        assert_eq!(lines[4], "PONG");
        assert_eq!(content.matches("session closed").count(), 1);
    }

    #[tokio::test]
    async fn hex_format_and_undelivered_tag() {
        let dir = tempfile::tempdir().unwrap();
        let (client, remote) = addrs();
        let mut logger = SessionLogger::new(&config(dir.path(), LogFormat::Hex), client, remote);

        let mut record = entry(Direction::ClientToRemote, 3, b"\x00\x01AB");
        record.delivered = false;
        logger.record(&record).await.unwrap();
        let path = logger.path().unwrap().to_path_buf();
        logger.close().await.unwrap();

        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("C->S #3 4 bytes (not delivered)"));
        assert!(content.contains("00000000  00 01 41 42"));
    }

    #[tokio::test]
    async fn unwritable_directory_is_a_log_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let (client, remote) = addrs();
        let mut logger = SessionLogger::new(&config(&blocker, LogFormat::Text), client, remote);
        let err = logger
            .record(&entry(Direction::ClientToRemote, 1, b"data"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "log_write");
        assert!(logger.close().await.is_ok());
    }

    #[tokio::test]
    async fn disabled_logger_is_a_sink() {
        let mut logger = SessionLogger::disabled();
        logger
            .record(&entry(Direction::ClientToRemote, 1, b"data"))
            .await
            .unwrap();
        assert!(logger.path().is_none());
        assert_eq!(logger.records(), 0);
        logger.close().await.unwrap();
    }

    #[test]
    fn ipv6_names_are_portable() {
        let name = log_file_name("[::1]:4000".parse().unwrap(), "[fe80::1]:443".parse().unwrap());
        assert_eq!(name, "__1-4000-fe80__1-443.log");
    }
}
