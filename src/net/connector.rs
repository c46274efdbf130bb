//! TLS connector.
//!
//! # Responsibilities
//! - Turn a candidate lease into an established [`PooledConnection`]
//! - Time TCP connect and TLS handshake separately
//! - Decide the application protocol (ALPN, else remembered, else HTTP/1.1)
//! - Report every outcome to the tracker
//!
//! # Design Decisions
//! - The whole attempt shares one deadline (`tls.connect_timeout_ms`)
//! - SNI is picked at random from the configured list and may not match
//!   the IP's real hostname

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::seq::SliceRandom;
use tokio::time::Instant;

use crate::config::FrontConfig;
use crate::error::{ConnectError, FailureKind};
use crate::health::{CandidateLease, IpQualityTracker};
use crate::net::cert::CertificateVerifier;
use crate::net::connection::{PooledConnection, Protocol};
use crate::net::socket::connect_tcp;
use crate::net::tls::TlsEngine;
use crate::observability::metrics;

/// Establishes front connections for the pool.
pub trait Connector: Send + Sync {
    /// Connect to the leased IP. The lease travels with the connection on
    /// success and is dropped on failure.
    fn connect(&self, lease: CandidateLease) -> BoxFuture<'_, Result<PooledConnection, ConnectError>>;
}

/// [`Connector`] over real TCP and an injected TLS engine.
pub struct TlsConnector {
    engine: Arc<dyn TlsEngine>,
    verifier: CertificateVerifier,
    tracker: Arc<IpQualityTracker>,
    port: u16,
    sni: Vec<String>,
    timeout: Duration,
}

impl TlsConnector {
    pub fn new(
        config: &FrontConfig,
        engine: Arc<dyn TlsEngine>,
        tracker: Arc<IpQualityTracker>,
    ) -> Self {
        Self {
            engine,
            verifier: CertificateVerifier::new(&config.tls),
            tracker,
            port: config.candidates.port,
            sni: config.candidates.sni.clone(),
            timeout: config.tls.connect_timeout(),
        }
    }

    pub fn with_verifier(mut self, verifier: CertificateVerifier) -> Self {
        self.verifier = verifier;
        self
    }

    fn pick_sni(&self) -> String {
        self.sni
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_else(|| "www.google.com".to_string())
    }

    async fn establish(
        &self,
        addr: SocketAddr,
        sni: &str,
        lease: CandidateLease,
    ) -> Result<PooledConnection, ConnectError> {
        let started = Instant::now();
        let tcp = connect_tcp(addr).await?;
        let connect_time = started.elapsed();

        let session = self.engine.handshake(tcp, sni).await?;
        let handshake_time = started.elapsed() - connect_time;

        self.verifier.verify(&session.peer_chain)?;

        let protocol = match session.alpn.as_deref().and_then(Protocol::from_alpn) {
            Some(protocol) => protocol,
            None => self.tracker.protocol(addr.ip()).unwrap_or(Protocol::Http1),
        };

        Ok(PooledConnection::new(
            addr,
            sni,
            protocol,
            connect_time,
            handshake_time,
            session.io,
            Some(lease),
        ))
    }
}

impl Connector for TlsConnector {
    fn connect(&self, lease: CandidateLease) -> BoxFuture<'_, Result<PooledConnection, ConnectError>> {
        Box::pin(async move {
            let ip = lease.ip();
            let addr = SocketAddr::new(ip, self.port);
            let sni = self.pick_sni();

            let result = match tokio::time::timeout(self.timeout, self.establish(addr, &sni, lease)).await {
                Ok(result) => result,
                Err(_) => Err(ConnectError::Timeout),
            };

            match &result {
                Ok(conn) => {
                    let handshake_ms = conn.handshake_time().as_millis() as u64;
                    self.tracker.report_success(ip, handshake_ms);
                    self.tracker.report_protocol(ip, conn.protocol());
                    metrics::record_connect("success");
                    metrics::record_handshake(conn.handshake_time());
                    tracing::debug!(
                        ip = %ip,
                        sni = %sni,
                        protocol = %conn.protocol(),
                        connect_ms = conn.info().connect_time.as_millis() as u64,
                        handshake_ms,
                        "Front connection established"
                    );
                }
                Err(e) => {
                    let kind = e.kind();
                    self.tracker.report_failure(ip, kind);
                    if kind != FailureKind::Trust {
                        self.tracker.network().report_fail(ip);
                    }
                    metrics::record_connect(kind.as_str());
                    tracing::debug!(ip = %ip, sni = %sni, error = %e, "Front connect failed");
                }
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use tokio::net::{TcpListener, TcpStream};

    use crate::config::TrackerConfig;
    use crate::health::LocalNetwork;
    use crate::net::tls::TlsSession;

    /// Completes the "handshake" without TLS, returning a fixed ALPN.
    struct PlainEngine {
        alpn: Option<&'static [u8]>,
    }

    impl TlsEngine for PlainEngine {
        fn handshake<'a>(
            &'a self,
            tcp: TcpStream,
            _server_name: &'a str,
        ) -> BoxFuture<'a, io::Result<TlsSession>> {
            Box::pin(async move {
                Ok(TlsSession {
                    io: Box::new(tcp),
                    alpn: self.alpn.map(<[u8]>::to_vec),
                    peer_chain: Vec::new(),
                })
            })
        }
    }

    async fn setup(alpn: Option<&'static [u8]>) -> (TlsConnector, Arc<IpQualityTracker>, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = FrontConfig::default();
        config.candidates.port = listener.local_addr().unwrap().port();

        let tracker = Arc::new(IpQualityTracker::new(
            TrackerConfig::default(),
            Arc::new(LocalNetwork::default()),
        ));
        tracker.add_candidates(["127.0.0.1".parse().unwrap()]);

        let connector = TlsConnector::new(&config, Arc::new(PlainEngine { alpn }), Arc::clone(&tracker));
        (connector, tracker, listener)
    }

    #[tokio::test]
    async fn negotiated_protocol_and_success_are_reported() {
        let (connector, tracker, listener) = setup(Some(b"h2")).await;
        let connector = connector.with_verifier(CertificateVerifier::permissive());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let lease = tracker.get_candidate().unwrap();
        let conn = connector.connect(lease).await.unwrap();
        accept.await.unwrap();

        assert_eq!(conn.protocol(), Protocol::Http2);
        let snap = tracker.snapshot("127.0.0.1".parse().unwrap()).unwrap();
        assert!(snap.latency_ms.is_some());
        assert_eq!(snap.protocol, Some(Protocol::Http2));
        assert_eq!(snap.in_flight, 1);
    }

    #[tokio::test]
    async fn missing_alpn_falls_back_to_remembered_protocol() {
        let (connector, tracker, listener) = setup(None).await;
        let connector = connector.with_verifier(CertificateVerifier::permissive());
        let ip = "127.0.0.1".parse().unwrap();
        tokio::spawn(async move {
            let _a = listener.accept().await.unwrap();
            let _b = listener.accept().await.unwrap();
        });

        let first = connector.connect(tracker.get_candidate().unwrap()).await.unwrap();
        assert_eq!(first.protocol(), Protocol::Http1);
        drop(first);

        tracker.report_protocol(ip, Protocol::Http2);
        let second = connector.connect(tracker.get_candidate().unwrap()).await.unwrap();
        assert_eq!(second.protocol(), Protocol::Http2);
    }

    #[tokio::test]
    async fn empty_chain_fails_trust_check() {
        let (connector, tracker, listener) = setup(Some(b"h2")).await;
        tokio::spawn(async move { listener.accept().await.unwrap() });

        let err = connector.connect(tracker.get_candidate().unwrap()).await.unwrap_err();
        assert_eq!(err.kind(), FailureKind::Trust);

        let snap = tracker.snapshot("127.0.0.1".parse().unwrap()).unwrap();
        assert!(snap.excluded);
        assert_eq!(snap.in_flight, 0);
        assert!(tracker.get_candidate().is_none());
    }
}
