//! Shared fixtures for the integration tests.
//!
//! [`FakeConnector`] hands out in-memory duplex connections whose far end
//! is served by a small HTTP/1.1 or HTTP/2 server, so the pool, workers and
//! dispatcher run end to end without sockets or TLS.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};

use frontline::config::{FrontConfig, PoolConfig};
use frontline::dispatch::Dispatcher;
use frontline::error::ConnectError;
use frontline::health::{CandidateLease, IpQualityTracker, LocalNetwork};
use frontline::lifecycle::Shutdown;
use frontline::net::{Connector, PooledConnection, Protocol};
use frontline::pool::ConnectionPool;

/// What sits on the far end of each fake connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMode {
    Http1,
    /// HTTP/1.1 that promises a longer body than it sends, then hangs up.
    TruncatedHttp1,
    /// HTTP/1.1 that answers once with `Connection: close`, then hangs up.
    CloseHttp1,
    Http2,
    /// Reads everything, answers nothing (not even pings).
    SilentHttp2,
}

/// What the fake servers observed.
#[derive(Debug, Default)]
pub struct ServerLog {
    served: Mutex<Vec<IpAddr>>,
    closed: Mutex<Vec<IpAddr>>,
    dropped: AtomicUsize,
}

impl ServerLog {
    pub fn served(&self) -> Vec<IpAddr> {
        self.served.lock().unwrap().clone()
    }

    /// Connections whose client half was dropped.
    pub fn closed(&self) -> Vec<IpAddr> {
        self.closed.lock().unwrap().clone()
    }

    /// Requests the server hung up on without answering.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

pub struct FakeConnector {
    mode: ServerMode,
    handshakes: HashMap<IpAddr, Duration>,
    default_handshake: Duration,
    fail_next: AtomicUsize,
    connects: AtomicUsize,
    pub log: Arc<ServerLog>,
}

impl FakeConnector {
    pub fn new(mode: ServerMode) -> Self {
        Self {
            mode,
            handshakes: HashMap::new(),
            default_handshake: Duration::from_millis(10),
            fail_next: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            log: Arc::new(ServerLog::default()),
        }
    }

    pub fn handshake(mut self, ip: IpAddr, handshake: Duration) -> Self {
        self.handshakes.insert(ip, handshake);
        self
    }

    /// The next `count` HTTP/1.1 connections hang up on their first request.
    pub fn fail_first_requests(self, count: usize) -> Self {
        self.fail_next.store(count, Ordering::SeqCst);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn protocol(&self) -> Protocol {
        match self.mode {
            ServerMode::Http1 | ServerMode::TruncatedHttp1 | ServerMode::CloseHttp1 => {
                Protocol::Http1
            }
            ServerMode::Http2 | ServerMode::SilentHttp2 => Protocol::Http2,
        }
    }
}

impl Connector for FakeConnector {
    fn connect(&self, lease: CandidateLease) -> BoxFuture<'_, Result<PooledConnection, ConnectError>> {
        Box::pin(async move {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let ip = lease.ip();
            let handshake = self
                .handshakes
                .get(&ip)
                .copied()
                .unwrap_or(self.default_handshake);
            tokio::time::sleep(handshake).await;

            let (client, server) = tokio::io::duplex(64 * 1024);
            let log = Arc::clone(&self.log);
            match self.mode {
                ServerMode::Http1 | ServerMode::TruncatedHttp1 | ServerMode::CloseHttp1 => {
                    let fail = self
                        .fail_next
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();
                    tokio::spawn(serve_http1(server, ip, log, fail, self.mode));
                }
                ServerMode::Http2 => {
                    tokio::spawn(serve_http2(server, ip, log));
                }
                ServerMode::SilentHttp2 => {
                    tokio::spawn(serve_silent(server, ip, log));
                }
            }

            let protocol = self.protocol();
            lease.tracker().report_success(ip, handshake.as_millis() as u64);
            lease.tracker().report_protocol(ip, protocol);
            Ok(PooledConnection::new(
                SocketAddr::new(ip, 443),
                "www.google.com",
                protocol,
                Duration::from_millis(1),
                handshake,
                Box::new(client),
                Some(lease),
            ))
        })
    }
}

/// HTTP/1.1 responder. The body is the serving IP.
async fn serve_http1(
    io: DuplexStream,
    ip: IpAddr,
    log: Arc<ServerLog>,
    fail_first: bool,
    mode: ServerMode,
) {
    let (read, mut write) = tokio::io::split(io);
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    loop {
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => {
                    log.closed.lock().unwrap().push(ip);
                    return;
                }
                Ok(_) if line == "\r\n" => break,
                Ok(_) => {}
            }
        }

        if fail_first {
            log.dropped.fetch_add(1, Ordering::SeqCst);
            return;
        }

        log.served.lock().unwrap().push(ip);
        let body = ip.to_string();
        let (length, extra) = match mode {
            ServerMode::TruncatedHttp1 => (body.len() + 100, ""),
            ServerMode::CloseHttp1 => (body.len(), "Connection: close\r\n"),
            _ => (body.len(), ""),
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {length}\r\nX-Served-By: {ip}\r\n{extra}\r\n{body}"
        );
        if write.write_all(response.as_bytes()).await.is_err() {
            return;
        }
        if mode != ServerMode::Http1 {
            let _ = write.shutdown().await;
            log.closed.lock().unwrap().push(ip);
            return;
        }
    }
}

async fn serve_http2(io: DuplexStream, ip: IpAddr, log: Arc<ServerLog>) {
    let Ok(mut conn) = h2::server::handshake(io).await else {
        return;
    };
    while let Some(result) = conn.accept().await {
        let Ok((_request, mut respond)) = result else {
            break;
        };
        log.served.lock().unwrap().push(ip);
        let response = http::Response::builder()
            .status(200)
            .header("x-served-by", ip.to_string())
            .body(())
            .unwrap();
        if let Ok(mut stream) = respond.send_response(response, false) {
            let _ = stream.send_data(Bytes::from(ip.to_string()), true);
        }
    }
    log.closed.lock().unwrap().push(ip);
}

async fn serve_silent(mut io: DuplexStream, ip: IpAddr, log: Arc<ServerLog>) {
    let mut buf = [0u8; 4096];
    loop {
        match io.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    log.closed.lock().unwrap().push(ip);
}

pub fn ip(last: u8) -> IpAddr {
    IpAddr::from([192, 0, 2, last])
}

/// Small, fast settings suited to paused-clock tests.
pub fn test_config() -> FrontConfig {
    let mut config = FrontConfig::default();
    config.pool = PoolConfig {
        min_size: 0,
        max_size: 4,
        no_candidate_cooldown_secs: 1,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        ..PoolConfig::default()
    };
    config.dispatcher.min_workers = 1;
    config.dispatcher.min_idle_workers = 1;
    config.dispatcher.get_worker_timeout_secs = 10;
    config.dispatcher.create_worker_timeout_secs = 10;
    config
}

/// A started pool and dispatcher over a [`FakeConnector`].
pub struct Harness {
    pub dispatcher: Arc<Dispatcher>,
    pub pool: Arc<ConnectionPool>,
    pub tracker: Arc<IpQualityTracker>,
    pub connector: Arc<FakeConnector>,
    pub shutdown: Shutdown,
}

impl Harness {
    pub fn start(config: FrontConfig, connector: FakeConnector, ips: &[IpAddr]) -> Self {
        let shutdown = Shutdown::new();
        let tracker = Arc::new(IpQualityTracker::new(
            config.tracker.clone(),
            Arc::new(LocalNetwork::default()),
        ));
        tracker.add_candidates(ips.iter().copied());

        let connector = Arc::new(connector);
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            Arc::clone(&tracker),
            connector.clone(),
            shutdown.subscribe(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(&config, Arc::clone(&pool), shutdown.clone()));
        pool.start();
        dispatcher.start();

        Self {
            dispatcher,
            pool,
            tracker,
            connector,
            shutdown,
        }
    }

    pub fn stop(&self) {
        self.dispatcher.stop();
    }
}

/// Poll `check` every 10 ms until it holds or `limit` passes.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Run `fut` with a generous upper bound so a hang fails the test.
pub async fn bounded<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(60), fut)
        .await
        .expect("test step timed out")
}
