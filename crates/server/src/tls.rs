//! TLS context: certificate loading and per-connection handshakes.
//!
//! One `ServerConfig` is built at startup and shared by every acceptor.
//! Only TLS 1.3 and TLS 1.2 are offered.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::{ConfigError, HandshakeError};

#[derive(Clone)]
pub struct TlsContext {
    acceptor: TlsAcceptor,
    cert_path: PathBuf,
}

impl TlsContext {
    /// Load the PEM certificate chain and private key and build the shared
    /// server configuration.
    pub fn initialize(cert_path: &Path, key_path: &Path) -> Result<Self, ConfigError> {
        let cert_file = open_readable(cert_path, "certificate")?;
        let key_file = open_readable(key_path, "private key")?;

        let certs = load_certs(cert_file, cert_path)?;
        let key = load_private_key(key_file, key_path)?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        info!(
            component = "tls",
            event = "tls.initialized",
            cert_path = %cert_path.display(),
            key_path = %key_path.display(),
            "TLS context ready"
        );

        Ok(Self {
            acceptor: TlsAcceptor::from(Arc::new(config)),
            cert_path: cert_path.to_path_buf(),
        })
    }

    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Run the server side of the handshake, bounded by `timeout`.
    pub async fn accept_handshake(
        &self,
        stream: TcpStream,
        timeout: Duration,
    ) -> Result<TlsStream<TcpStream>, HandshakeError> {
        match tokio::time::timeout(timeout, self.acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Ok(tls),
            Ok(Err(e)) => Err(HandshakeError::Failed(e)),
            Err(_) => Err(HandshakeError::Timeout(timeout)),
        }
    }
}

/// Checked up front so a missing file is reported as such rather than as a
/// parse failure.
fn open_readable(path: &Path, kind: &'static str) -> Result<File, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::MissingFile {
            kind,
            path: path.to_path_buf(),
        });
    }
    if !path.is_file() {
        return Err(ConfigError::Unreadable {
            kind,
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        });
    }
    File::open(path).map_err(|source| ConfigError::Unreadable {
        kind,
        path: path.to_path_buf(),
        source,
    })
}

fn load_certs(file: File, path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| ConfigError::Unreadable {
            kind: "certificate",
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(ConfigError::EmptyPem {
            kind: "certificate",
            path: path.to_path_buf(),
        });
    }
    Ok(certs)
}

fn load_private_key(file: File, path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| ConfigError::Unreadable {
            kind: "private key",
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| ConfigError::EmptyPem {
            kind: "private key",
            path: path.to_path_buf(),
        })
}


#[cfg(test)]
mod tests {
    use super::testing::write_self_signed;
    use super::*;

    #[test]
    fn valid_pair_initializes() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        let ctx = TlsContext::initialize(&cert.cert_path, &cert.key_path).unwrap();
        assert_eq!(ctx.cert_path(), cert.cert_path.as_path());
    }

    #[test]
    fn missing_certificate_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        let err = TlsContext::initialize(&tmp.path().join("absent.pem"), &cert.key_path)
            .err()
            .expect("missing cert must fail");
        assert!(matches!(err, ConfigError::MissingFile { kind: "certificate", .. }));
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        let err = TlsContext::initialize(&cert.cert_path, &tmp.path().join("absent.key"))
            .err()
            .expect("missing key must fail");
        assert!(matches!(err, ConfigError::MissingFile { kind: "private key", .. }));
    }

    #[test]
    fn directory_instead_of_file_is_unreadable() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        let err = TlsContext::initialize(tmp.path(), &cert.key_path)
            .err()
            .expect("directory must fail");
        assert!(matches!(err, ConfigError::Unreadable { .. }));
    }

    #[test]
    fn pem_without_key_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        // A certificate file holds no private key block.
        let err = TlsContext::initialize(&cert.cert_path, &cert.cert_path)
            .err()
            .expect("cert as key must fail");
        assert!(matches!(err, ConfigError::EmptyPem { kind: "private key", .. }));
    }

    #[tokio::test]
    async fn plaintext_client_fails_handshake() {
        use tokio::io::AsyncWriteExt;

        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        let ctx = TlsContext::initialize(&cert.cert_path, &cert.key_path).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut tcp = TcpStream::connect(addr).await.unwrap();
            tcp.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            tcp
        });

        let (stream, _) = listener.accept().await.unwrap();
        let result = ctx.accept_handshake(stream, Duration::from_secs(5)).await;
        assert!(matches!(result, Err(HandshakeError::Failed(_))));
        drop(client.await.unwrap());
    }

    #[tokio::test]
    async fn silent_client_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let cert = write_self_signed(tmp.path());
        let ctx = TlsContext::initialize(&cert.cert_path, &cert.key_path).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();

        let result = ctx
            .accept_handshake(stream, Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    }
}
