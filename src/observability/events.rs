//! Status events for whoever controls the relay.
//!
//! The relay reports what it is doing as [`RelayEvent`]s on an unbounded
//! channel. Each event renders as a one-line status message through `Display`
//! and as a JSON object through `serde`. A controller that stops listening
//! never affects relaying.

use std::fmt;
use std::net::SocketAddr;

use serde::Serialize;
use tokio::sync::mpsc;

/// Something the controlling side may want to show.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RelayEvent {
    /// The listener is bound and accepting.
    Listening { addr: SocketAddr },
    /// A client connection was accepted.
    SessionOpened { id: u64, client: SocketAddr },
    /// Both sides are connected and the pumps are running.
    SessionRelaying {
        id: u64,
        client: SocketAddr,
        remote: SocketAddr,
    },
    /// Session setup failed. The relay keeps accepting.
    SessionFailed {
        id: u64,
        client: SocketAddr,
        /// Configured remote target, as `host:port`.
        remote: String,
        kind: &'static str,
        reason: String,
    },
    /// A session finished teardown.
    SessionClosed {
        id: u64,
        client: SocketAddr,
        remote: Option<SocketAddr>,
        client_messages: u64,
        server_messages: u64,
    },
    /// A new pipeline set was swapped in.
    PipelineReloaded {
        client_stages: Vec<String>,
        server_stages: Vec<String>,
    },
    /// The relay released its port and every session is gone.
    Stopped,
}

impl fmt::Display for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::Listening { addr } => write!(f, "Listening on {}", addr),
            RelayEvent::SessionOpened { id, client } => {
                write!(f, "[session {}] Connection from {}", id, client)
            }
            RelayEvent::SessionRelaying { id, client, remote } => {
                write!(f, "[session {}] Relaying {} <-> {}", id, client, remote)
            }
            RelayEvent::SessionFailed {
                id,
                client,
                remote,
                kind,
                reason,
            } => write!(
                f,
                "[session {}] {} -> {} failed ({}): {}",
                id, client, remote, kind, reason
            ),
            RelayEvent::SessionClosed {
                id,
                client,
                remote,
                client_messages,
                server_messages,
            } => {
                write!(f, "[session {}] Closed {}", id, client)?;
                if let Some(remote) = remote {
                    write!(f, " <-> {}", remote)?;
                }
                write!(
                    f,
                    " after {} client and {} server messages",
                    client_messages, server_messages
                )
            }
            RelayEvent::PipelineReloaded {
                client_stages,
                server_stages,
            } => write!(
                f,
                "Modules reloaded: client [{}], server [{}]",
                client_stages.join(", "),
                server_stages.join(", ")
            ),
            RelayEvent::Stopped => f.write_str("Relay stopped"),
        }
    }
}

/// Sending half of the status channel.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<RelayEvent>>,
}

impl EventSink {
    /// A connected sink and the receiver the controller reads from.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RelayEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: RelayEvent) {
        tracing::debug!(%event, "Relay event");
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_status_lines() {
        let event = RelayEvent::SessionFailed {
            id: 4,
            client: "127.0.0.1:50000".parse().unwrap(),
            remote: "ldap.example.com:636".into(),
            kind: "remote_connect",
            reason: "connection refused".into(),
        };
        assert_eq!(
            event.to_string(),
            "[session 4] 127.0.0.1:50000 -> ldap.example.com:636 failed (remote_connect): connection refused"
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "session_failed");
        assert_eq!(json["remote"], "ldap.example.com:636");

        let closed = RelayEvent::SessionClosed {
            id: 5,
            client: "127.0.0.1:50001".parse().unwrap(),
            remote: Some("10.0.0.1:389".parse().unwrap()),
            client_messages: 2,
            server_messages: 1,
        };
        assert_eq!(
            closed.to_string(),
            "[session 5] Closed 127.0.0.1:50001 <-> 10.0.0.1:389 after 2 client and 1 server messages"
        );
    }

    #[test]
    fn events_serialize_with_tag() {
        let json = serde_json::to_value(RelayEvent::Listening {
            addr: "127.0.0.1:8080".parse().unwrap(),
        })
        .unwrap();
        assert_eq!(json["event"], "listening");
        assert_eq!(json["addr"], "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn dropped_receiver_is_ignored() {
        let (sink, mut rx) = EventSink::channel();
        sink.emit(RelayEvent::Stopped);
        assert_eq!(rx.recv().await, Some(RelayEvent::Stopped));

        drop(rx);
        sink.emit(RelayEvent::Stopped);
        EventSink::disabled().emit(RelayEvent::Stopped);
    }
}
