//! Pooled front connection.
//!
//! # Responsibilities
//! - Own the TLS I/O handle of one established front connection
//! - Carry connect/handshake timings used for ranking
//! - Hold the candidate lease until the connection is gone
//!
//! # Design Decisions
//! - A connection moves into exactly one worker (`into_parts` consumes it)
//! - `close` returns a report; the caller decides whom to tell

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use crate::health::CandidateLease;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a front connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Application protocol spoken on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Protocol {
    #[serde(rename = "http/1.1")]
    Http1,
    #[serde(rename = "h2")]
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http1 => "http/1.1",
            Protocol::Http2 => "h2",
        }
    }

    pub fn from_alpn(alpn: &[u8]) -> Option<Self> {
        match alpn {
            b"h2" => Some(Protocol::Http2),
            b"http/1.1" => Some(Protocol::Http1),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Byte stream a worker can drive.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

pub type BoxedIo = Box<dyn Io>;

/// Metadata of an established connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub addr: SocketAddr,
    pub sni: String,
    pub protocol: Protocol,
    /// TCP connect duration.
    pub connect_time: Duration,
    /// TLS handshake duration. Pool ordering key.
    pub handshake_time: Duration,
    pub created_at: Instant,
    pub last_use: Instant,
}

impl ConnectionInfo {
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// What happened to a closed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReport {
    pub id: ConnectionId,
    pub ip: IpAddr,
    pub reason: String,
    pub lifetime: Duration,
}

/// An established, not yet claimed, TLS connection.
pub struct PooledConnection {
    info: ConnectionInfo,
    io: BoxedIo,
    lease: Option<CandidateLease>,
}

impl PooledConnection {
    pub fn new(
        addr: SocketAddr,
        sni: impl Into<String>,
        protocol: Protocol,
        connect_time: Duration,
        handshake_time: Duration,
        io: BoxedIo,
        lease: Option<CandidateLease>,
    ) -> Self {
        let now = Instant::now();
        Self {
            info: ConnectionInfo {
                id: ConnectionId::new(),
                addr,
                sni: sni.into(),
                protocol,
                connect_time,
                handshake_time,
                created_at: now,
                last_use: now,
            },
            io,
            lease,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn id(&self) -> ConnectionId {
        self.info.id
    }

    pub fn ip(&self) -> IpAddr {
        self.info.ip()
    }

    pub fn protocol(&self) -> Protocol {
        self.info.protocol
    }

    pub fn handshake_time(&self) -> Duration {
        self.info.handshake_time
    }

    /// Hand the socket over to a worker.
    pub fn into_parts(mut self) -> (ConnectionInfo, BoxedIo, Option<CandidateLease>) {
        self.info.last_use = Instant::now();
        (self.info, self.io, self.lease)
    }

    /// Drop the socket and the lease.
    pub fn close(self, reason: &str) -> CloseReport {
        let report = CloseReport {
            id: self.info.id,
            ip: self.info.ip(),
            reason: reason.to_string(),
            lifetime: self.info.age(Instant::now()),
        };
        tracing::debug!(
            connection_id = %report.id,
            ip = %report.ip,
            reason,
            lifetime_ms = report.lifetime.as_millis() as u64,
            "Connection closed"
        );
        report
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("info", &self.info)
            .field("leased", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::TrackerConfig;
    use crate::health::{IpQualityTracker, LocalNetwork};

    #[test]
    fn connection_id_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn alpn_mapping() {
        assert_eq!(Protocol::from_alpn(b"h2"), Some(Protocol::Http2));
        assert_eq!(Protocol::from_alpn(b"http/1.1"), Some(Protocol::Http1));
        assert_eq!(Protocol::from_alpn(b"spdy/3"), None);
    }

    #[tokio::test]
    async fn close_releases_lease_and_reports() {
        let tracker = Arc::new(IpQualityTracker::new(
            TrackerConfig::default(),
            Arc::new(LocalNetwork::default()),
        ));
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        tracker.add_candidates([ip]);
        let lease = tracker.get_candidate().unwrap();

        let (client, _server) = tokio::io::duplex(64);
        let conn = PooledConnection::new(
            SocketAddr::new(ip, 443),
            "www.google.com",
            Protocol::Http1,
            Duration::from_millis(5),
            Duration::from_millis(20),
            Box::new(client),
            Some(lease),
        );
        assert_eq!(tracker.snapshot(ip).unwrap().in_flight, 1);

        let report = conn.close("alive_timeout");
        assert_eq!(report.ip, ip);
        assert_eq!(report.reason, "alive_timeout");
        assert_eq!(tracker.snapshot(ip).unwrap().in_flight, 0);
    }
}
