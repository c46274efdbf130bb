//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the front
//! connection pool and dispatcher.
//! All types derive Serde traits for deserialization from config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct FrontConfig {
    /// Candidate frontend addresses and the names presented to them.
    pub candidates: CandidateConfig,

    /// TLS handshake and certificate authenticity settings.
    pub tls: TlsConfig,

    /// Per-IP quality tracking.
    pub tracker: TrackerConfig,

    /// Warm connection pool.
    pub pool: PoolConfig,

    /// Per-connection request workers.
    pub worker: WorkerConfig,

    /// Task dispatching, retries and worker eviction.
    pub dispatcher: DispatcherConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Candidate frontend configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CandidateConfig {
    /// Static candidate IPs. Refreshing this list is handled outside the core.
    pub ips: Vec<String>,

    /// TCP port to connect to.
    pub port: u16,

    /// Server names presented as SNI. One is picked per connection attempt.
    /// May differ from the HTTP host (domain fronting).
    pub sni: Vec<String>,
}

impl Default for CandidateConfig {
    fn default() -> Self {
        Self {
            ips: Vec::new(),
            port: 443,
            sni: vec!["www.google.com".to_string()],
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// TCP connect + TLS handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// ALPN protocols offered, in preference order.
    pub alpn: Vec<String>,

    /// Minimum number of certificates the peer must present.
    pub min_chain_len: usize,

    /// Allowed intermediate CA keys, as base64 SHA-256 of the SPKI
    /// (optionally prefixed with `sha256/`). Empty disables pinning.
    pub pinned_intermediates: Vec<String>,

    /// Required prefix of the leaf certificate issuer common name.
    /// Empty disables the check.
    pub issuer_prefix: String,

    /// Optional PEM bundle of extra trust anchors, added to the built-in roots.
    pub ca_file: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 4_000,
            alpn: vec!["h2".to_string(), "http/1.1".to_string()],
            min_chain_len: 3,
            pinned_intermediates: Vec::new(),
            issuer_prefix: "Google".to_string(),
            ca_file: None,
        }
    }
}

impl TlsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// IP quality tracker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum live or connecting sockets per IP.
    pub max_in_flight_per_ip: usize,

    /// Number of outcomes kept per IP.
    pub history_len: usize,

    /// Latency assumed for IPs that never completed a handshake.
    pub unknown_latency_ms: u64,

    /// Largest increase applied to an IP's latency by a single report.
    pub max_latency_step_ms: u64,

    /// Cooldown after a failure when the IP succeeded recently.
    pub failure_cooldown_secs: u64,

    /// Cooldown after a failure when the IP has not succeeded recently.
    pub long_failure_cooldown_secs: u64,

    /// Window defining "succeeded recently".
    pub recent_success_secs: u64,

    /// Cooldown after a response body failure on a connection to the IP.
    pub down_fail_cooldown_secs: u64,

    /// Consecutive connect failures (with no success) after which the local
    /// network is considered down.
    pub network_fail_threshold: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_in_flight_per_ip: 1,
            history_len: 16,
            unknown_latency_ms: 1_000,
            max_latency_step_ms: 500,
            failure_cooldown_secs: 120,
            long_failure_cooldown_secs: 1_800,
            recent_success_secs: 300,
            down_fail_cooldown_secs: 600,
            network_fail_threshold: 5,
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept warm even without demand.
    pub min_size: usize,

    /// Upper bound on pooled connections.
    pub max_size: usize,

    /// Maximum concurrent connect attempts (filler tasks).
    pub max_connect_attempts: usize,

    /// A pooled connection not claimed within this time is closed.
    pub first_use_timeout_secs: u64,

    /// Idle sweep period.
    pub sweep_interval_secs: u64,

    /// Back-off when the tracker has no eligible candidate.
    pub no_candidate_cooldown_secs: u64,

    /// Spacing between successive attempts of one filler.
    pub connect_interval_ms: u64,

    /// Base of the exponential back-off after a failed attempt.
    pub backoff_base_ms: u64,

    /// Cap of the exponential back-off after a failed attempt.
    pub backoff_max_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 2,
            max_size: 20,
            max_connect_attempts: 4,
            first_use_timeout_secs: 54,
            sweep_interval_secs: 5,
            no_candidate_cooldown_secs: 10,
            connect_interval_ms: 0,
            backoff_base_ms: 1_000,
            backoff_max_ms: 10_000,
        }
    }
}

impl PoolConfig {
    pub fn first_use_timeout(&self) -> Duration {
        Duration::from_secs(self.first_use_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn no_candidate_cooldown(&self) -> Duration {
        Duration::from_secs(self.no_candidate_cooldown_secs)
    }

    pub fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base connection lifetime; each worker picks a deadline in [1.0, 1.5) of it.
    pub max_life_secs: u64,

    /// HTTP/1.1 connections idle longer than this are closed.
    pub http1_idle_timeout_secs: u64,

    /// Requests served by one HTTP/1.1 connection before it is retired.
    pub http1_max_processed: u64,

    /// Requests served by one HTTP/2 connection before it is retired.
    pub http2_max_processed: u64,

    /// Concurrent streams per HTTP/2 connection.
    pub http2_max_streams: usize,

    /// HTTP/2 connections inactive this long get a PING.
    pub ping_interval_secs: u64,

    /// Time to wait for a PING acknowledgement.
    pub ping_timeout_ms: u64,

    /// Consecutive failed pings before the connection is declared dead.
    pub max_ping_failures: u32,

    /// An HTTP/2 connection with no activity this long is declared dead.
    pub dead_after_secs: u64,

    /// Time to wait for response headers.
    pub response_timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_life_secs: 600,
            http1_idle_timeout_secs: 360,
            http1_max_processed: 1_000,
            http2_max_processed: 10_000,
            http2_max_streams: 60,
            ping_interval_secs: 10,
            ping_timeout_ms: 5_000,
            max_ping_failures: 3,
            dead_after_secs: 230,
            response_timeout_secs: 100,
        }
    }
}

impl WorkerConfig {
    pub fn max_life(&self) -> Duration {
        Duration::from_secs(self.max_life_secs)
    }

    pub fn http1_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.http1_idle_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn dead_after(&self) -> Duration {
        Duration::from_secs(self.dead_after_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Upper bound on live workers.
    pub max_workers: usize,

    /// Below this many workers the pool is always asked for more.
    pub min_workers: usize,

    /// Below this many idle workers the pool is asked for more.
    pub min_idle_workers: usize,

    /// Eviction floor: the worst worker is only closed when at least this
    /// many workers score below `good_score`.
    pub max_idle_workers: usize,

    /// Eviction fraction: good workers must also make up this share of all workers.
    pub idle_fraction: f64,

    /// A best score above this asks the pool for more connections.
    pub good_score: u64,

    /// Workers scoring above this are never selected.
    pub unusable_score: u64,

    /// Retries allowed per task.
    pub max_retries: u32,

    /// Longest wait for a worker for one task.
    pub get_worker_timeout_secs: u64,

    /// Longest wait for a pooled connection when growing.
    pub create_worker_timeout_secs: u64,

    /// Outstanding tasks allowed before new requests are refused.
    pub max_pending_tasks: usize,

    /// Period of keep-alive checks and eviction.
    pub check_interval_secs: u64,

    /// Failed tasks in a row after which a worker is retired.
    pub worker_max_consecutive_failures: u32,

    /// Timeout applied by `request` when the caller passes none.
    pub default_task_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: 50,
            min_workers: 1,
            min_idle_workers: 2,
            max_idle_workers: 8,
            idle_fraction: 0.2,
            good_score: 1_000,
            unusable_score: 20_000,
            max_retries: 10,
            get_worker_timeout_secs: 30,
            create_worker_timeout_secs: 60,
            max_pending_tasks: 200,
            check_interval_secs: 5,
            worker_max_consecutive_failures: 10,
            default_task_timeout_secs: 60,
        }
    }
}

impl DispatcherConfig {
    pub fn get_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.get_worker_timeout_secs)
    }

    pub fn create_worker_timeout(&self) -> Duration {
        Duration::from_secs(self.create_worker_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs.max(1))
    }

    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_secs(self.default_task_timeout_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format: "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
