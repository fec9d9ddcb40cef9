//! TLS endpoint negotiation.
//!
//! Each side of a session is negotiated on its own: the relay is the TLS
//! server toward clients and the TLS client toward the remote. Certificate
//! material is read from disk at every negotiation, so replacing files on
//! disk takes effect for the next session.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{ring, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    server::WebPkiClientVerifier,
    DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsSideConfig;
use crate::error::{RelayError, Result};
use crate::net::stream::RelayStream;

/// Which end of the handshake the relay plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole<'a> {
    /// Facing the client: present our certificate.
    Server,
    /// Facing the remote: verify (or not) the remote certificate.
    Client { server_name: &'a str },
}

/// Wrap `tcp` with TLS according to `tls`, or hand it back unchanged.
///
/// Missing or unreadable material is `TlsConfig`; a failed or timed-out
/// handshake is `TlsHandshake`. No application bytes are exchanged before
/// this returns `Ok`.
pub async fn negotiate(
    tcp: TcpStream,
    role: TlsRole<'_>,
    tls: &TlsSideConfig,
    handshake_timeout: Duration,
) -> Result<RelayStream> {
    if !tls.enabled {
        return Ok(RelayStream::Plain(tcp));
    }

    let peer = tcp.peer_addr()?;
    let handshake_failed = |reason: String| RelayError::TlsHandshake { peer, reason };

    match role {
        TlsRole::Server => {
            let acceptor = TlsAcceptor::from(Arc::new(server_config(tls)?));
            let stream = tokio::time::timeout(handshake_timeout, acceptor.accept(tcp))
                .await
                .map_err(|_| handshake_failed(timed_out(handshake_timeout)))?
                .map_err(|e| handshake_failed(e.to_string()))?;
            tracing::debug!(peer = %peer, "Client-side TLS established");
            Ok(RelayStream::ServerTls(Box::new(stream)))
        }
        TlsRole::Client { server_name } => {
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| RelayError::tls_config(format!("invalid server name '{}': {}", server_name, e)))?;
            let connector = TlsConnector::from(Arc::new(client_config(tls)?));
            let stream = tokio::time::timeout(handshake_timeout, connector.connect(name, tcp))
                .await
                .map_err(|_| handshake_failed(timed_out(handshake_timeout)))?
                .map_err(|e| handshake_failed(e.to_string()))?;
            tracing::debug!(peer = %peer, server_name, verify = tls.verify_remote(), "Remote-side TLS established");
            Ok(RelayStream::ClientTls(Box::new(stream)))
        }
    }
}

fn timed_out(after: Duration) -> String {
    format!("handshake timed out after {:?}", after)
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Server-role config: our certificate, plus client verification if asked.
pub fn server_config(tls: &TlsSideConfig) -> Result<rustls::ServerConfig> {
    let cert_path = tls
        .cert_path
        .as_deref()
        .ok_or_else(|| RelayError::tls_config("local TLS is enabled but no certificate is configured"))?;
    let key_path = tls.key_source().map(|p| p.as_path()).unwrap_or(cert_path);
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let builder = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::tls_config(format!("TLS version error: {}", e)))?;

    let builder = if tls.verify_clients() {
        let ca_path = tls.client_ca_path.as_deref().ok_or_else(|| {
            RelayError::tls_config("client verification is enabled but no client CA is configured")
        })?;
        let roots = root_store(ca_path)?;
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider())
            .build()
            .map_err(|e| RelayError::tls_config(format!("client verifier error: {}", e)))?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    builder
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::tls_config(format!("unusable certificate/key: {}", e)))
}

/// Client-role config: roots or no verification, optional client certificate.
pub fn client_config(tls: &TlsSideConfig) -> Result<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| RelayError::tls_config(format!("TLS version error: {}", e)))?;

    let builder = if tls.verify_remote() {
        let roots = match tls.ca_path.as_deref() {
            Some(ca_path) => root_store(ca_path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        builder.with_root_certificates(roots)
    } else {
        tracing::debug!("Remote certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
    };

    match tls.cert_path.as_deref() {
        Some(cert_path) => {
            let key_path = tls.key_source().map(|p| p.as_path()).unwrap_or(cert_path);
            let certs = load_certs(cert_path)?;
            let key = load_private_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| RelayError::tls_config(format!("unusable client certificate: {}", e)))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| RelayError::tls_config(format!("cannot read {}: {}", path.display(), e)))
}

/// Load every certificate in a PEM file. An empty file is an error.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RelayError::tls_config(format!("malformed PEM in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(RelayError::tls_config(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;
    loop {
        let item = rustls_pemfile::read_one(&mut reader)
            .map_err(|e| RelayError::tls_config(format!("malformed PEM in {}: {}", path.display(), e)))?;
        match item {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => break,
        }
    }
    Err(RelayError::tls_config(format!(
        "no private key found in {}",
        path.display()
    )))
}

fn root_store(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| RelayError::tls_config(format!("failed to add CA cert: {}", e)))?;
    }
    Ok(roots)
}

/// Accepts any server certificate. Only used when `verify = false`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
