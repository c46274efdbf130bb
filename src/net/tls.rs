//! TLS client engine.
//!
//! # Responsibilities
//! - Wrap an established TCP stream in TLS with a chosen SNI
//! - Report the negotiated ALPN protocol and the peer chain
//!
//! # Design Decisions
//! - The engine sits behind a trait so the connector can be driven by a
//!   different TLS stack, or none at all in tests
//! - rustls with the ring provider; webpki roots plus an optional PEM bundle

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;

use crate::config::loader::ConfigError;
use crate::config::TlsConfig;
use crate::net::connection::BoxedIo;

/// Result of a completed TLS handshake.
pub struct TlsSession {
    pub io: BoxedIo,
    pub alpn: Option<Vec<u8>>,
    pub peer_chain: Vec<CertificateDer<'static>>,
}

/// Client-side TLS handshake.
pub trait TlsEngine: Send + Sync {
    fn handshake<'a>(
        &'a self,
        tcp: TcpStream,
        server_name: &'a str,
    ) -> BoxFuture<'a, io::Result<TlsSession>>;
}

/// [`TlsEngine`] backed by rustls.
#[derive(Clone)]
pub struct RustlsEngine {
    connector: tokio_rustls::TlsConnector,
}

impl RustlsEngine {
    pub fn new(config: &TlsConfig) -> Result<Self, ConfigError> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = &config.ca_file {
            let added = load_ca_file(&mut roots, Path::new(path))?;
            tracing::info!(path = %path, added, "Loaded CA bundle");
        }
        Self::from_root_store(roots, &config.alpn)
    }

    pub fn from_root_store(roots: RootCertStore, alpn: &[String]) -> Result<Self, ConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut client = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ConfigError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();
        client.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();

        Ok(Self {
            connector: tokio_rustls::TlsConnector::from(Arc::new(client)),
        })
    }
}

fn load_ca_file(roots: &mut RootCertStore, path: &Path) -> Result<usize, ConfigError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut added = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert?)
            .map_err(|e| ConfigError::Tls(format!("{}: {e}", path.display())))?;
        added += 1;
    }
    if added == 0 {
        return Err(ConfigError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(added)
}

impl TlsEngine for RustlsEngine {
    fn handshake<'a>(
        &'a self,
        tcp: TcpStream,
        server_name: &'a str,
    ) -> BoxFuture<'a, io::Result<TlsSession>> {
        Box::pin(async move {
            let name = ServerName::try_from(server_name.to_string())
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
            let stream = self.connector.connect(name, tcp).await?;

            let (_, session) = stream.get_ref();
            let alpn = session.alpn_protocol().map(<[u8]>::to_vec);
            let peer_chain = session
                .peer_certificates()
                .map(|chain| chain.iter().map(|c| c.clone().into_owned()).collect())
                .unwrap_or_default();

            Ok(TlsSession {
                io: Box::new(stream),
                alpn,
                peer_chain,
            })
        })
    }
}
