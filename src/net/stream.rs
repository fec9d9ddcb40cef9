//! A relayed connection, plain or wrapped in TLS.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// One side of a session after negotiation.
///
/// The local side may only be `Plain` or `ServerTls`, the remote side only
/// `Plain` or `ClientTls`; the session does not care which.
#[derive(Debug)]
pub enum RelayStream {
    Plain(TcpStream),
    /// The relay is the TLS server (client-facing side).
    ServerTls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    /// The relay is the TLS client (remote-facing side).
    ClientTls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl RelayStream {
    pub fn is_tls(&self) -> bool {
        !matches!(self, RelayStream::Plain(_))
    }

    /// Transport label for logs.
    pub fn transport(&self) -> &'static str {
        if self.is_tls() {
            "tls"
        } else {
            "tcp"
        }
    }

    pub fn tcp(&self) -> &TcpStream {
        match self {
            RelayStream::Plain(s) => s,
            RelayStream::ServerTls(s) => s.get_ref().0,
            RelayStream::ClientTls(s) => s.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().local_addr()
    }
}

impl AsyncRead for RelayStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::ServerTls(s) => Pin::new(s).poll_read(cx, buf),
            RelayStream::ClientTls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for RelayStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::ServerTls(s) => Pin::new(s).poll_write(cx, buf),
            RelayStream::ClientTls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_flush(cx),
            RelayStream::ServerTls(s) => Pin::new(s).poll_flush(cx),
            RelayStream::ClientTls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            RelayStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::ServerTls(s) => Pin::new(s).poll_shutdown(cx),
            RelayStream::ClientTls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
