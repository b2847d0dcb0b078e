//! TLS for DIMSE connections
//!
//! PEM material named by [`TlsConfig`] is loaded once into a connector (SCU)
//! or acceptor (SCP); the resulting [`Connection`]s report `is_encrypted()`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::debug;

use crate::association::Connection;
use crate::config::TlsConfig;
use crate::error::{DimseError, Result, TimeoutStage};

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| DimseError::config(format!("Failed to open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DimseError::config(format!("Invalid certificate in {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(DimseError::config(format!(
            "No certificate found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| DimseError::config(format!("Invalid private key in {}: {}", path.display(), e)))?
        .ok_or_else(|| DimseError::config(format!("No private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Certificate chain and key, when both paths are configured.
fn identity(
    config: &TlsConfig,
) -> Result<Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>> {
    match (&config.cert_path, &config.key_path) {
        (Some(cert), Some(key)) => Ok(Some((load_certs(cert)?, load_key(key)?))),
        (None, None) => Ok(None),
        _ => Err(DimseError::config(
            "TLS cert_path and key_path must be configured together",
        )),
    }
}

/// Client side TLS.
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let ca = config
            .ca_bundle_path
            .as_deref()
            .ok_or_else(|| DimseError::config("TLS client requires ca_bundle_path"))?;
        let builder = ClientConfig::builder().with_root_certificates(load_roots(ca)?);
        let client = match identity(config)? {
            Some((certs, key)) => builder.with_client_auth_cert(certs, key)?,
            None => builder.with_no_client_auth(),
        };
        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(client)),
        })
    }

    /// Connect over TCP and run the TLS handshake, both within `timeout`.
    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        server_name: Option<&str>,
        timeout: Duration,
    ) -> Result<Connection> {
        let name = ServerName::try_from(server_name.unwrap_or(host).to_string())
            .map_err(|e| DimseError::config(format!("Invalid TLS server name: {e}")))?;
        debug!("Connecting to {}:{} with TLS", host, port);
        let handshake = async {
            let tcp = TcpStream::connect((host, port)).await?;
            tcp.set_nodelay(true)?;
            let peer_addr = tcp.peer_addr().ok();
            let stream = self.inner.connect(name, tcp).await?;
            Ok::<_, std::io::Error>((stream, peer_addr))
        };
        let (stream, peer_addr) = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| DimseError::AssociationTimeout(TimeoutStage::Connect))??;
        Ok(Connection::new(stream, true).with_peer_addr(peer_addr))
    }
}

/// Server side TLS.
#[derive(Clone)]
pub struct TlsAcceptor {
    inner: tokio_rustls::TlsAcceptor,
}

impl TlsAcceptor {
    pub fn from_config(config: &TlsConfig) -> Result<Self> {
        let (certs, key) = identity(config)?
            .ok_or_else(|| DimseError::config("TLS server requires cert_path and key_path"))?;
        let builder = if config.require_client_cert {
            let ca = config.ca_bundle_path.as_deref().ok_or_else(|| {
                DimseError::config("require_client_cert needs ca_bundle_path")
            })?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(load_roots(ca)?))
                .build()
                .map_err(|e| DimseError::config(format!("Invalid client CA bundle: {e}")))?;
            ServerConfig::builder().with_client_cert_verifier(verifier)
        } else {
            ServerConfig::builder().with_no_client_auth()
        };
        let server = builder.with_single_cert(certs, key)?;
        Ok(Self {
            inner: tokio_rustls::TlsAcceptor::from(Arc::new(server)),
        })
    }

    /// Run the server handshake on an accepted socket within `timeout`.
    pub async fn accept(&self, tcp: TcpStream, timeout: Duration) -> Result<Connection> {
        let peer_addr = tcp.peer_addr().ok();
        let stream = tokio::time::timeout(timeout, self.inner.accept(tcp))
            .await
            .map_err(|_| DimseError::AssociationTimeout(TimeoutStage::AssociationRequest))??;
        Ok(Connection::new(stream, true).with_peer_addr(peer_addr))
    }
}
