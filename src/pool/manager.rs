//! Connection pool manager.
//!
//! # Responsibilities
//! - Keep between `min_size` and `max_size` handshaked connections warm
//! - Hand out the fastest connection exclusively
//! - Expire connections nobody claimed in time
//!
//! # Design Decisions
//! - One mutex over the store and counters, plus a not-empty notification
//! - Connect attempts are separate tasks bounded by a semaphore, the same
//!   way the listener bounds accepted connections
//! - Waiting acquirers count as demand so fillers run past `min_size`
//! - Lock order is pool, then tracker

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::health::IpQualityTracker;
use crate::lifecycle::ShutdownSignal;
use crate::net::{Connector, PooledConnection, Protocol};
use crate::observability::metrics;
use crate::pool::store::ConnectionStore;
use crate::resilience::backoff::connect_backoff;

/// Pool size relative to its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    BelowMin,
    Steady,
    AboveMax,
}

/// Serializable pool snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub state: PoolState,
    pub size: usize,
    pub http1: usize,
    pub http2: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub min_size: usize,
    pub max_size: usize,
}

#[derive(Debug, Default)]
struct PoolInner {
    store: ConnectionStore,
    connecting: usize,
    waiting: usize,
}

/// Warm pool of front connections.
pub struct ConnectionPool {
    config: PoolConfig,
    tracker: Arc<IpQualityTracker>,
    connector: Arc<dyn Connector>,
    inner: Mutex<PoolInner>,
    not_empty: Notify,
    demand: Notify,
    attempts: Arc<Semaphore>,
    consecutive_failures: AtomicU32,
    shutdown: ShutdownSignal,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        tracker: Arc<IpQualityTracker>,
        connector: Arc<dyn Connector>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let attempts = Arc::new(Semaphore::new(config.max_connect_attempts));
        Self {
            config,
            tracker,
            connector,
            inner: Mutex::new(PoolInner::default()),
            not_empty: Notify::new(),
            demand: Notify::new(),
            attempts,
            consecutive_failures: AtomicU32::new(0),
            shutdown,
        }
    }

    pub fn tracker(&self) -> &Arc<IpQualityTracker> {
        &self.tracker
    }

    /// Spawn the filler supervisor and the idle sweep.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        tracing::info!(
            min = self.config.min_size,
            max = self.config.max_size,
            max_connect_attempts = self.config.max_connect_attempts,
            "Connection pool starting"
        );
        vec![
            tokio::spawn(Arc::clone(self).supervise()),
            tokio::spawn(Arc::clone(self).sweep_loop()),
        ]
    }

    fn state_for(&self, size: usize) -> PoolState {
        if size < self.config.min_size {
            PoolState::BelowMin
        } else if size > self.config.max_size {
            PoolState::AboveMax
        } else {
            PoolState::Steady
        }
    }

    fn needs_connection(&self, inner: &PoolInner) -> bool {
        let pending = inner.store.len() + inner.connecting;
        if pending >= self.config.max_size {
            return false;
        }
        pending < self.config.min_size || inner.waiting > inner.connecting
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let notified = self.demand.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.spawn_fillers();

            tokio::select! {
                _ = &mut notified => {}
                _ = shutdown.recv() => break,
            }
        }
        tracing::debug!("Pool supervisor stopped");
    }

    fn spawn_fillers(self: &Arc<Self>) {
        while !self.shutdown.is_triggered() {
            let permit = {
                let mut inner = self.inner.lock().expect("pool mutex poisoned");
                if !self.needs_connection(&inner) {
                    return;
                }
                let Ok(permit) = Arc::clone(&self.attempts).try_acquire_owned() else {
                    return;
                };
                inner.connecting += 1;
                permit
            };
            tokio::spawn(Arc::clone(self).fill_one(permit));
        }
    }

    async fn fill_one(self: Arc<Self>, _permit: OwnedSemaphorePermit) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = self.attempt() => {}
            _ = shutdown.recv() => {}
        }
        {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            inner.connecting -= 1;
        }
        self.demand.notify_one();
    }

    async fn attempt(&self) {
        let interval = self.config.connect_interval();
        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }

        let Some(lease) = self.tracker.get_candidate() else {
            tracing::debug!(
                cooldown_secs = self.config.no_candidate_cooldown_secs,
                "No candidate IP available"
            );
            tokio::time::sleep(self.config.no_candidate_cooldown()).await;
            return;
        };

        match self.connector.connect(lease).await {
            Ok(conn) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.put(conn);
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let delay = connect_backoff(
                    failures,
                    self.tracker.network().is_ok(),
                    self.config.backoff_base_ms,
                    self.config.backoff_max_ms,
                );
                tracing::debug!(
                    error = %e,
                    failures,
                    delay_ms = delay.as_millis() as u64,
                    "Pool connect failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    /// Add a connection. Above `max_size` the slowest one is closed.
    pub fn put(&self, conn: PooledConnection) {
        if self.shutdown.is_triggered() {
            conn.close("shutdown");
            return;
        }

        let (evicted, size) = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            inner.store.insert(conn);
            let evicted = if inner.store.len() > self.config.max_size {
                inner.store.take_slowest()
            } else {
                None
            };
            (evicted, inner.store.len())
        };

        if let Some(conn) = evicted {
            let report = conn.close("pool_full");
            self.tracker.report_closed(report.ip, &report.reason);
        }
        metrics::record_pool_size(size);
        self.not_empty.notify_waiters();
    }

    /// Take the fastest connection, waiting up to `timeout` when `block`.
    pub async fn acquire(
        &self,
        block: bool,
        timeout: Duration,
        protocol: Option<Protocol>,
    ) -> Option<PooledConnection> {
        let deadline = Instant::now() + timeout;
        let mut demand: Option<DemandGuard<'_>> = None;

        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.take_fresh(protocol) {
                return Some(conn);
            }
            if !block || self.shutdown.is_triggered() || Instant::now() >= deadline {
                return None;
            }
            if demand.is_none() {
                demand = Some(DemandGuard::new(self));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    fn take_fresh(&self, protocol: Option<Protocol>) -> Option<PooledConnection> {
        let max_age = self.config.first_use_timeout();
        let (conn, stale, size) = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            let stale = inner.store.take_expired(Instant::now(), max_age);
            let conn = inner.store.take_fastest(protocol);
            (conn, stale, inner.store.len())
        };

        let refill = conn.is_some() || !stale.is_empty();
        for conn in stale {
            let report = conn.close("get_timeout");
            self.tracker.report_closed(report.ip, &report.reason);
        }
        if refill {
            metrics::record_pool_size(size);
            self.demand.notify_one();
        }
        conn
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.clone();
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep();
                }
                _ = shutdown.recv() => break,
            }
        }
        self.close_all();
    }

    /// Close connections unclaimed past `first_use_timeout`.
    pub fn sweep(&self) -> usize {
        let (expired, size) = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            let expired = inner
                .store
                .take_expired(Instant::now(), self.config.first_use_timeout());
            (expired, inner.store.len())
        };
        let count = expired.len();
        for conn in expired {
            let report = conn.close("alive_timeout");
            self.tracker.report_closed(report.ip, &report.reason);
        }
        if count > 0 {
            tracing::debug!(expired = count, size, "Idle connections swept");
            self.demand.notify_one();
        }
        metrics::record_pool_size(size);
        count
    }

    pub fn close_all(&self) {
        let conns = self.inner.lock().expect("pool mutex poisoned").store.drain();
        let count = conns.len();
        for conn in conns {
            conn.close("shutdown");
        }
        metrics::record_pool_size(0);
        self.not_empty.notify_waiters();
        if count > 0 {
            tracing::info!(closed = count, "Connection pool drained");
        }
    }

    pub fn size(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn status(&self) -> PoolStatus {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        let size = inner.store.len();
        PoolStatus {
            state: self.state_for(size),
            size,
            http1: inner.store.count(Protocol::Http1),
            http2: inner.store.count(Protocol::Http2),
            connecting: inner.connecting,
            waiting: inner.waiting,
            min_size: self.config.min_size,
            max_size: self.config.max_size,
        }
    }
}

/// Registers a blocked acquirer as demand for the lifetime of the wait.
struct DemandGuard<'a> {
    pool: &'a ConnectionPool,
}

impl<'a> DemandGuard<'a> {
    fn new(pool: &'a ConnectionPool) -> Self {
        pool.inner.lock().expect("pool mutex poisoned").waiting += 1;
        pool.demand.notify_one();
        Self { pool }
    }
}

impl Drop for DemandGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.pool.inner.lock().expect("pool mutex poisoned");
        inner.waiting = inner.waiting.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    use futures_util::future::BoxFuture;

    use crate::config::TrackerConfig;
    use crate::error::ConnectError;
    use crate::health::{CandidateLease, LocalNetwork};
    use crate::lifecycle::Shutdown;

    /// Hands out in-memory connections with a fixed handshake time.
    struct MemoryConnector {
        calls: AtomicUsize,
        handshake: Duration,
    }

    impl Connector for MemoryConnector {
        fn connect(&self, lease: CandidateLease) -> BoxFuture<'_, Result<PooledConnection, ConnectError>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let (client, server) = tokio::io::duplex(1024);
                tokio::spawn(async move {
                    let _server = server;
                    std::future::pending::<()>().await;
                });
                Ok(PooledConnection::new(
                    SocketAddr::new(lease.ip(), 443),
                    "www.google.com",
                    Protocol::Http1,
                    Duration::from_millis(1),
                    self.handshake,
                    Box::new(client),
                    Some(lease),
                ))
            })
        }
    }

    fn pool(config: PoolConfig, ips: usize) -> (Arc<ConnectionPool>, Arc<MemoryConnector>, Shutdown) {
        let tracker = Arc::new(IpQualityTracker::new(
            TrackerConfig::default(),
            Arc::new(LocalNetwork::default()),
        ));
        tracker.add_candidates((1..=ips).map(|i| format!("192.0.2.{i}").parse().unwrap()));
        let connector = Arc::new(MemoryConnector {
            calls: AtomicUsize::new(0),
            handshake: Duration::from_millis(40),
        });
        let shutdown = Shutdown::new();
        let pool = Arc::new(ConnectionPool::new(
            config,
            tracker,
            connector.clone(),
            shutdown.subscribe(),
        ));
        (pool, connector, shutdown)
    }

    #[tokio::test(start_paused = true)]
    async fn fills_to_min_size() {
        let config = PoolConfig {
            min_size: 3,
            max_size: 5,
            ..PoolConfig::default()
        };
        let (pool, connector, shutdown) = pool(config, 6);
        pool.start();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.size(), 3);
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
        assert_eq!(pool.status().state, PoolState::Steady);
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn zero_sized_pool_never_connects() {
        let config = PoolConfig {
            min_size: 0,
            max_size: 0,
            max_connect_attempts: 0,
            ..PoolConfig::default()
        };
        let (pool, connector, shutdown) = pool(config, 3);
        pool.start();

        let started = Instant::now();
        let conn = pool.acquire(true, Duration::from_secs(2), None).await;
        assert!(conn.is_none());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquirer_drives_fill_past_min() {
        let config = PoolConfig {
            min_size: 0,
            max_size: 4,
            ..PoolConfig::default()
        };
        let (pool, connector, shutdown) = pool(config, 2);
        pool.start();

        let conn = pool.acquire(true, Duration::from_secs(5), None).await;
        assert!(conn.is_some());
        assert!(connector.calls.load(Ordering::SeqCst) >= 1);
        assert_eq!(pool.status().waiting, 0);
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn unclaimed_connections_expire() {
        let config = PoolConfig {
            min_size: 1,
            max_size: 1,
            first_use_timeout_secs: 10,
            ..PoolConfig::default()
        };
        let (pool, _connector, shutdown) = pool(config, 1);
        pool.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.size(), 1);

        // Sweep runs every 5s; the connection is strictly older than 10s at 15s.
        tokio::time::sleep(Duration::from_secs(16)).await;
        let snap = pool.tracker().snapshot("192.0.2.1".parse().unwrap()).unwrap();
        assert_eq!(snap.last_close_reason.as_deref(), Some("alive_timeout"));
        shutdown.trigger();
    }

    #[tokio::test(start_paused = true)]
    async fn non_blocking_acquire_returns_immediately() {
        let (pool, _connector, _shutdown) = pool(PoolConfig::default(), 1);
        assert!(pool.acquire(false, Duration::from_secs(30), None).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_pool() {
        let config = PoolConfig {
            min_size: 2,
            max_size: 2,
            ..PoolConfig::default()
        };
        let (pool, _connector, shutdown) = pool(config, 2);
        let handles = pool.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(pool.size(), 2);

        shutdown.trigger();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(pool.is_empty());
    }
}
