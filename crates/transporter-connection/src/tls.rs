//! Dialing and accepting agent connections, optionally over mutual TLS

use crate::transport::{tune_keepalive, FramedTransport, TransportError, TransportResult};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Upper bound for establishing the TCP leg of an outbound connection
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// PEM files for one side of a mutual-TLS connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    /// CA used to verify the peer certificate
    pub ca_certificate: PathBuf,
    /// Our own certificate chain
    pub certificate: PathBuf,
    /// Private key matching `certificate`
    pub private_key: PathBuf,
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::Tls(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::Tls("No private key found".to_string()))
}

fn load_roots(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
    }
    Ok(roots)
}

/// Outbound side: how an agent reaches the server
#[derive(Clone)]
pub enum Connector {
    Plain,
    Tls {
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl Connector {
    pub fn plain() -> Self {
        Connector::Plain
    }

    /// Present `files.certificate` and verify the server against `files.ca_certificate`
    pub fn mutual_tls(files: &TlsFiles, server_name: &str) -> TransportResult<Self> {
        ensure_crypto_provider();

        let roots = load_roots(&files.ca_certificate)?;
        let certs = load_certs(&files.certificate)?;
        let key = load_private_key(&files.private_key)?;

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .map_err(|e| TransportError::Tls(format!("Invalid client certificate: {}", e)))?;

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::Tls(format!("Invalid server name: {}", e)))?;

        Ok(Connector::Tls {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
        })
    }

    /// Dial `addr` and return a framed transport ready for the first signal
    pub async fn connect(&self, addr: &str) -> TransportResult<FramedTransport> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        if let Err(e) = tune_keepalive(&stream) {
            debug!(error = %e, "Failed to enable TCP keep-alive");
        }
        let peer_addr = stream.peer_addr()?;

        match self {
            Connector::Plain => Ok(FramedTransport::new(stream).with_peer_addr(peer_addr)),
            Connector::Tls {
                connector,
                server_name,
            } => {
                let tls = connector
                    .connect(server_name.clone(), stream)
                    .await
                    .map_err(|e| TransportError::Tls(format!("Handshake failed: {}", e)))?;
                Ok(FramedTransport::new(tls).with_peer_addr(peer_addr))
            }
        }
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connector::Plain => f.write_str("Connector::Plain"),
            Connector::Tls { server_name, .. } => f
                .debug_struct("Connector::Tls")
                .field("server_name", server_name)
                .finish(),
        }
    }
}

/// Inbound side: how the server admits agent connections
#[derive(Clone)]
pub enum Acceptor {
    Plain,
    Tls(TlsAcceptor),
}

impl Acceptor {
    pub fn plain() -> Self {
        Acceptor::Plain
    }

    /// Require a client certificate signed by `files.ca_certificate`
    pub fn mutual_tls(files: &TlsFiles) -> TransportResult<Self> {
        ensure_crypto_provider();

        let roots = load_roots(&files.ca_certificate)?;
        let certs = load_certs(&files.certificate)?;
        let key = load_private_key(&files.private_key)?;

        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| TransportError::Tls(format!("Invalid client verifier: {}", e)))?;

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::Tls(format!("Invalid server certificate: {}", e)))?;

        Ok(Acceptor::Tls(TlsAcceptor::from(Arc::new(config))))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, Acceptor::Tls(_))
    }

    /// Finish accepting a raw TCP connection
    pub async fn accept(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> TransportResult<FramedTransport> {
        if let Err(e) = tune_keepalive(&stream) {
            debug!(peer_addr = %peer_addr, error = %e, "Failed to enable TCP keep-alive");
        }

        match self {
            Acceptor::Plain => Ok(FramedTransport::new(stream).with_peer_addr(peer_addr)),
            Acceptor::Tls(acceptor) => {
                let tls = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| TransportError::Tls(format!("Handshake failed: {}", e)))?;
                Ok(FramedTransport::new(tls).with_peer_addr(peer_addr))
            }
        }
    }
}

impl std::fmt::Debug for Acceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Acceptor::Plain => f.write_str("Acceptor::Plain"),
            Acceptor::Tls(_) => f.write_str("Acceptor::Tls"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use transporter_proto::Signal;

    #[tokio::test]
    async fn test_plain_connect_and_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            let mut transport = Acceptor::plain().accept(stream, peer).await.unwrap();
            assert_eq!(transport.peer_addr(), Some(peer));
            transport.read_signal().await.unwrap()
        });

        let mut client = Connector::plain().connect(&addr.to_string()).await.unwrap();
        assert_eq!(client.peer_addr(), Some(addr));
        client.write_signal(&Signal::ping()).await.unwrap();

        assert_eq!(server.await.unwrap(), Signal::ping());
    }

    #[tokio::test]
    async fn test_missing_certificate_files() {
        let files = TlsFiles {
            ca_certificate: PathBuf::from("/nonexistent/ca.pem"),
            certificate: PathBuf::from("/nonexistent/cert.pem"),
            private_key: PathBuf::from("/nonexistent/key.pem"),
        };

        assert!(matches!(
            Acceptor::mutual_tls(&files),
            Err(TransportError::Tls(_))
        ));
        assert!(matches!(
            Connector::mutual_tls(&files, "localhost"),
            Err(TransportError::Tls(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(Connector::plain().connect(&addr.to_string()).await.is_err());
    }
}
