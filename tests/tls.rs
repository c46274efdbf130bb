//! Real TLS handshakes against a local rustls server with a generated chain.

use std::net::IpAddr;
use std::sync::Arc;

use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, Issuer, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{RootCertStore, ServerConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use frontline::config::{FrontConfig, TrackerConfig};
use frontline::error::{ConnectError, FailureKind};
use frontline::health::{IpQualityTracker, LocalNetwork};
use frontline::net::{Connector, Protocol, RustlsEngine, TlsConnector};

const SNI: &str = "front.test";

struct Chain {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    root: CertificateDer<'static>,
}

fn ca_params(cn: &str) -> CertificateParams {
    let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
    params.distinguished_name.push(DnType::CommonName, cn);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
}

fn chain(intermediate_cn: &str) -> Chain {
    let root_key = KeyPair::generate().unwrap();
    let root_params = ca_params("Frontline Test Root");
    let root = root_params.self_signed(&root_key).unwrap();
    let root_issuer = Issuer::new(root_params, root_key);

    let inter_key = KeyPair::generate().unwrap();
    let inter_params = ca_params(intermediate_cn);
    let inter = inter_params.signed_by(&inter_key, &root_issuer).unwrap();
    let inter_issuer = Issuer::new(inter_params, inter_key);

    let leaf_key = KeyPair::generate().unwrap();
    let leaf_params = CertificateParams::new(vec![SNI.to_string()]).unwrap();
    let leaf = leaf_params.signed_by(&leaf_key, &inter_issuer).unwrap();

    Chain {
        certs: vec![leaf.der().clone(), inter.der().clone(), root.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        root: root.der().clone(),
    }
}

/// Accept TLS connections and hold each one open until the client leaves.
async fn serve(chain: &Chain) -> u16 {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(chain.certs.clone(), chain.key.clone_key())
        .unwrap();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                if let Ok(mut tls) = acceptor.accept(tcp).await {
                    let mut buf = [0u8; 1024];
                    while matches!(tls.read(&mut buf).await, Ok(n) if n > 0) {}
                }
            });
        }
    });
    port
}

fn connector(trusted_root: &CertificateDer<'static>, port: u16) -> (TlsConnector, Arc<IpQualityTracker>, IpAddr) {
    let mut config = FrontConfig::default();
    config.candidates.port = port;
    config.candidates.sni = vec![SNI.to_string()];

    let mut roots = RootCertStore::empty();
    roots.add(trusted_root.clone()).unwrap();
    let engine = RustlsEngine::from_root_store(roots, &config.tls.alpn).unwrap();

    let ip: IpAddr = "127.0.0.1".parse().unwrap();
    let tracker = Arc::new(IpQualityTracker::new(
        TrackerConfig::default(),
        Arc::new(LocalNetwork::default()),
    ));
    tracker.add_candidates([ip]);
    let connector = TlsConnector::new(&config, Arc::new(engine), Arc::clone(&tracker));
    (connector, tracker, ip)
}

#[tokio::test]
async fn genuine_front_negotiates_http2() {
    let chain = chain("Google Internet Authority G3");
    let port = serve(&chain).await;
    let (connector, tracker, ip) = connector(&chain.root, port);

    let lease = tracker.get_candidate().unwrap();
    let conn = connector.connect(lease).await.unwrap();
    assert_eq!(conn.protocol(), Protocol::Http2);
    assert_eq!(conn.ip(), ip);

    let snap = tracker.snapshot(ip).unwrap();
    assert!(snap.latency_ms.is_some());
    assert_eq!(snap.in_flight, 1);
    assert_eq!(tracker.protocol(ip), Some(Protocol::Http2));

    conn.close("test_done");
    assert_eq!(tracker.snapshot(ip).unwrap().in_flight, 0);
}

#[tokio::test]
async fn foreign_issuer_is_excluded_for_good() {
    let chain = chain("Intercepting Proxy CA");
    let port = serve(&chain).await;
    let (connector, tracker, ip) = connector(&chain.root, port);

    let lease = tracker.get_candidate().unwrap();
    let err = connector.connect(lease).await.unwrap_err();
    assert!(matches!(err, ConnectError::Trust(_)));
    assert_eq!(err.kind(), FailureKind::Trust);

    let snap = tracker.snapshot(ip).unwrap();
    assert!(snap.excluded);
    assert!(tracker.get_candidate().is_none());
    assert!(tracker.network().is_ok());
}

#[tokio::test]
async fn unknown_root_is_a_trust_failure() {
    let served = chain("Google Internet Authority G3");
    let trusted = chain("Google Internet Authority G3");
    let port = serve(&served).await;
    let (connector, tracker, ip) = connector(&trusted.root, port);

    let lease = tracker.get_candidate().unwrap();
    let err = connector.connect(lease).await.unwrap_err();
    assert!(matches!(err, ConnectError::Trust(_)), "unexpected error: {err}");
    assert!(tracker.snapshot(ip).unwrap().excluded);
}
