//! Directional byte pump.
//!
//! One pump per direction per session. Each chunk is read, numbered, run
//! through the direction's pipeline, written in full to the destination and
//! then logged, strictly in arrival order.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::observability::metrics;
use crate::session::logger::{LogEntry, SharedLogger};
use crate::transform::{Direction, MessageContext, PipelineSet};

/// Per-direction message numbering, starting at 1. Never reused.
#[derive(Debug)]
pub struct SequenceCounter {
    next: u64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Take the next number.
    pub fn next(&mut self) -> u64 {
        let n = self.next;
        self.next += 1;
        n
    }

    /// How many numbers have been handed out.
    pub fn issued(&self) -> u64 {
        self.next - 1
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Last time either direction of a session moved data.
#[derive(Debug)]
pub struct ActivityClock {
    origin: Instant,
    last_ms: AtomicU64,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.origin.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a pump stopped.
#[derive(Debug)]
pub enum PumpExit {
    /// The source reached end of stream.
    Eof,
    /// The session is closing (sibling pump exited, idle timeout or stop).
    Cancelled,
    ReadError(io::Error),
    WriteError(io::Error),
}

impl PumpExit {
    pub fn describe(&self) -> String {
        match self {
            PumpExit::Eof => "peer closed".to_string(),
            PumpExit::Cancelled => "cancelled".to_string(),
            PumpExit::ReadError(e) => format!("read error: {}", e),
            PumpExit::WriteError(e) => format!("write error: {}", e),
        }
    }

    /// The error that ended the pump. `None` when it was told to stop.
    pub fn into_error(self) -> Option<RelayError> {
        match self {
            PumpExit::Eof => Some(RelayError::PeerClosed),
            PumpExit::Cancelled => None,
            PumpExit::ReadError(e) | PumpExit::WriteError(e) => Some(RelayError::Io(e)),
        }
    }
}

#[derive(Debug)]
pub struct PumpReport {
    pub direction: Direction,
    pub exit: PumpExit,
    /// Chunks read and numbered.
    pub messages: u64,
    /// Bytes written to the destination.
    pub bytes_forwarded: u64,
}

/// Moves bytes from `reader` to `writer` for one direction.
pub struct Pump<R, W> {
    pub direction: Direction,
    pub reader: R,
    pub writer: W,
    /// Sender of the chunks this pump reads.
    pub source: SocketAddr,
    /// Receiver of the chunks this pump writes.
    pub destination: SocketAddr,
    pub pipelines: Arc<PipelineSet>,
    pub logger: SharedLogger,
    pub chunk_size: usize,
    pub closing: CancellationToken,
    pub activity: Arc<ActivityClock>,
}

impl<R, W> Pump<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Run until EOF, an I/O error or cancellation.
    ///
    /// On exit the session's closing token is cancelled, so the sibling pump
    /// stops too, and the destination writer is shut down.
    pub async fn run(mut self) -> PumpReport {
        let mut sequence = SequenceCounter::new();
        let mut bytes_forwarded = 0u64;
        let mut buf = vec![0u8; self.chunk_size.max(1)];

        let exit = loop {
            let read = tokio::select! {
                biased;
                _ = self.closing.cancelled() => break PumpExit::Cancelled,
                read = self.reader.read(&mut buf) => read,
            };
            let n = match read {
                Ok(0) => break PumpExit::Eof,
                Ok(n) => n,
                Err(e) => break PumpExit::ReadError(e),
            };
            self.activity.touch();

            let message_number = sequence.next();
            let ctx = MessageContext::new(
                message_number,
                self.direction,
                self.source,
                self.destination,
            );
            let output = self.pipelines.apply(&ctx, buf[..n].to_vec());

            let written = tokio::select! {
                biased;
                _ = self.closing.cancelled() => Err(None),
                result = write_chunk(&mut self.writer, &output.data) => result.map_err(Some),
            };

            self.log(message_number, &output.data, written.is_ok()).await;

            match written {
                Ok(()) => {
                    bytes_forwarded += output.data.len() as u64;
                    metrics::record_chunk(self.direction, output.data.len());
                    self.activity.touch();
                }
                Err(None) => break PumpExit::Cancelled,
                Err(Some(e)) => break PumpExit::WriteError(e),
            }
        };

        self.closing.cancel();
        let shutdown = tokio::time::timeout(Duration::from_secs(1), self.writer.shutdown()).await;
        if let Ok(Err(e)) = shutdown {
            tracing::trace!(direction = %self.direction, "Writer shutdown failed: {}", e);
        }

        tracing::debug!(
            direction = %self.direction,
            source = %self.source,
            destination = %self.destination,
            messages = sequence.issued(),
            bytes = bytes_forwarded,
            reason = %exit.describe(),
            "Pump stopped"
        );

        PumpReport {
            direction: self.direction,
            exit,
            messages: sequence.issued(),
            bytes_forwarded,
        }
    }

    async fn log(&self, message_number: u64, data: &[u8], delivered: bool) {
        let entry = LogEntry {
            direction: self.direction,
            message_number,
            data,
            delivered,
        };
        if let Err(e) = self.logger.lock().await.record(&entry).await {
            metrics::record_log_write_failure();
            tracing::warn!(
                direction = %self.direction,
                message_number,
                error = %e,
                "Session log degraded, traffic still forwarded"
            );
        }
    }
}

async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogFormat, SessionLogConfig};
    use crate::session::logger::SessionLogger;
    use crate::transform::builtin::Uppercase;
    use crate::transform::Pipeline;
    use tokio::sync::Mutex;

    fn addrs() -> (SocketAddr, SocketAddr) {
        ("127.0.0.1:5000".parse().unwrap(), "127.0.0.1:6000".parse().unwrap())
    }

    fn pump<R, W>(reader: R, writer: W, pipelines: PipelineSet, logger: SharedLogger) -> Pump<R, W> {
        let (source, destination) = addrs();
        Pump {
            direction: Direction::ClientToRemote,
            reader,
            writer,
            source,
            destination,
            pipelines: Arc::new(pipelines),
            logger,
            chunk_size: 4096,
            closing: CancellationToken::new(),
            activity: Arc::new(ActivityClock::new()),
        }
    }

    #[test]
    fn sequence_starts_at_one() {
        let mut seq = SequenceCounter::new();
        assert_eq!(seq.issued(), 0);
        assert_eq!((seq.next(), seq.next(), seq.next()), (1, 2, 3));
        assert_eq!(seq.issued(), 3);
    }

    #[tokio::test]
    async fn forwards_transformed_chunks_until_eof() {
        let dir = tempfile::tempdir().unwrap();
        let (client, remote) = addrs();
        let logger: SharedLogger = Arc::new(Mutex::new(SessionLogger::new(
            &SessionLogConfig {
                enabled: true,
                directory: dir.path().to_path_buf(),
                format: LogFormat::Text,
            },
            client,
            remote,
        )));

        let (mut feed, reader) = tokio::io::duplex(64);
        let (writer, mut sink) = tokio::io::duplex(64);
        let pipelines = PipelineSet::new(
            Pipeline::new(Direction::ClientToRemote, vec![Arc::new(Uppercase)]),
            Pipeline::empty(Direction::RemoteToClient),
        );
        let task = tokio::spawn(pump(reader, writer, pipelines, Arc::clone(&logger)).run());

        feed.write_all(b"ping").await.unwrap();
        let mut got = [0u8; 4];
        sink.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"PING");
        drop(feed);

        let report = task.await.unwrap();
        assert!(matches!(report.exit, PumpExit::Eof));
        assert_eq!(report.messages, 1);
        assert_eq!(report.bytes_forwarded, 4);

        let mut rest = Vec::new();
        sink.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let mut logger = logger.lock().await;
        assert_eq!(logger.records(), 1);
        let path = logger.path().unwrap().to_path_buf();
        logger.close().await.unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        assert!(content.contains("C->S #1 4 bytes\nPING\n"));
    }

    #[test]
    fn exits_map_to_relay_errors() {
        assert_eq!(PumpExit::Eof.into_error().unwrap().kind(), "peer_closed");
        assert!(PumpExit::Cancelled.into_error().is_none());
        let reset = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(PumpExit::WriteError(reset).into_error().unwrap().kind(), "io");
    }

    #[tokio::test]
    async fn cancellation_unblocks_idle_read() {
        let (_feed, reader) = tokio::io::duplex(64);
        let (writer, _sink) = tokio::io::duplex(64);
        let pump = pump(
            reader,
            writer,
            PipelineSet::empty(),
            Arc::new(Mutex::new(SessionLogger::disabled())),
        );
        let closing = pump.closing.clone();
        let task = tokio::spawn(pump.run());

        closing.cancel();
        let report = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(report.exit, PumpExit::Cancelled));
        assert_eq!(report.messages, 0);
    }

    #[tokio::test]
    async fn exit_cancels_sibling() {
        let (feed, reader) = tokio::io::duplex(64);
        let (writer, _sink) = tokio::io::duplex(64);
        let pump = pump(
            reader,
            writer,
            PipelineSet::empty(),
            Arc::new(Mutex::new(SessionLogger::disabled())),
        );
        let closing = pump.closing.clone();
        drop(feed);

        let report = pump.run().await;
        assert!(matches!(report.exit, PumpExit::Eof));
        assert!(closing.is_cancelled());
    }

    #[test]
    fn activity_clock_tracks_idle_time() {
        let clock = ActivityClock::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(clock.idle_for() >= Duration::from_millis(20));
        clock.touch();
        assert!(clock.idle_for() < Duration::from_millis(20));
    }
}
