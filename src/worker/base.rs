//! Protocol-independent worker state.
//!
//! # Responsibilities
//! - Count outstanding and processed tasks, consecutive failures and RTT
//! - Decide life end (randomized max life, task cap, failure cap)
//! - Close exactly once: release the lease, report the reason, emit an event

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::dispatch::policy::ResponseClass;
use crate::health::CandidateLease;
use crate::net::ConnectionInfo;
use crate::observability::metrics;
use crate::worker::score::{self, ScoreInput};
use crate::worker::{WorkerContext, WorkerEvent, WorkerStatus};

#[derive(Debug)]
struct WorkerStats {
    outstanding: usize,
    processed: u64,
    consecutive_failures: u32,
    rtt_ms: u64,
    last_active: Instant,
    last_ping_ok: Option<Instant>,
    close_reason: Option<String>,
}

pub struct WorkerBase {
    info: ConnectionInfo,
    ctx: WorkerContext,
    life_deadline: Instant,
    max_processed: u64,
    stats: Mutex<WorkerStats>,
    closed: watch::Sender<bool>,
    lease: Mutex<Option<CandidateLease>>,
}

impl WorkerBase {
    pub fn new(
        info: ConnectionInfo,
        lease: Option<CandidateLease>,
        ctx: WorkerContext,
        max_processed: u64,
    ) -> Self {
        // 1.0x to 1.5x of max life.
        let life = ctx.config.max_life().mul_f64(1.0 + fastrand::f64() * 0.5);
        let now = Instant::now();
        let (closed, _) = watch::channel(false);
        Self {
            life_deadline: info.created_at + life,
            stats: Mutex::new(WorkerStats {
                outstanding: 0,
                processed: 0,
                consecutive_failures: 0,
                rtt_ms: info.handshake_time.as_millis() as u64,
                last_active: now,
                last_ping_ok: None,
                close_reason: None,
            }),
            info,
            ctx,
            max_processed,
            closed,
            lease: Mutex::new(lease),
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn ctx(&self) -> &WorkerContext {
        &self.ctx
    }

    pub fn begin_task(&self) {
        let mut stats = self.stats.lock().expect("worker mutex poisoned");
        stats.outstanding += 1;
        stats.last_active = Instant::now();
    }

    /// Account for a finished task. `rtt` is the time to the response head.
    pub fn complete(&self, rtt: Option<Duration>, class: ResponseClass) {
        let idle = {
            let mut stats = self.stats.lock().expect("worker mutex poisoned");
            stats.outstanding = stats.outstanding.saturating_sub(1);
            stats.last_active = Instant::now();
            if let Some(rtt) = rtt {
                stats.rtt_ms = score::update_rtt(stats.rtt_ms, rtt);
            }
            match class {
                ResponseClass::Success => {
                    stats.processed += 1;
                    stats.consecutive_failures = 0;
                }
                ResponseClass::SoftSuccess => stats.processed += 1,
                ResponseClass::Failure => stats.consecutive_failures += 1,
            }
            stats.outstanding == 0
        };
        if idle && !self.is_closed() {
            let _ = self.ctx.events.send(WorkerEvent::Idle(self.info.id));
        }
    }

    /// Release the slot of a task that never reached the wire.
    pub fn abandon(&self) {
        let idle = {
            let mut stats = self.stats.lock().expect("worker mutex poisoned");
            stats.outstanding = stats.outstanding.saturating_sub(1);
            stats.outstanding == 0
        };
        if idle && !self.is_closed() {
            let _ = self.ctx.events.send(WorkerEvent::Idle(self.info.id));
        }
    }

    pub fn outstanding(&self) -> usize {
        self.stats.lock().expect("worker mutex poisoned").outstanding
    }

    pub fn processed(&self) -> u64 {
        self.stats.lock().expect("worker mutex poisoned").processed
    }

    pub fn score(&self) -> u64 {
        if self.is_closed() {
            return u64::MAX;
        }
        let stats = self.stats.lock().expect("worker mutex poisoned");
        score::compute(ScoreInput {
            rtt_ms: stats.rtt_ms,
            outstanding: stats.outstanding,
            age: self.info.age(Instant::now()),
            consecutive_failures: stats.consecutive_failures,
        })
    }

    pub fn life_end(&self) -> bool {
        if Instant::now() >= self.life_deadline {
            return true;
        }
        let stats = self.stats.lock().expect("worker mutex poisoned");
        stats.processed >= self.max_processed
            || stats.consecutive_failures > self.ctx.max_consecutive_failures
    }

    /// Time since the last task activity.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let stats = self.stats.lock().expect("worker mutex poisoned");
        now.saturating_duration_since(stats.last_active)
    }

    /// Time since the peer last proved alive (task activity or ping reply).
    pub fn silent_for(&self, now: Instant) -> Duration {
        let stats = self.stats.lock().expect("worker mutex poisoned");
        let last_seen = match stats.last_ping_ok {
            Some(ping) if ping > stats.last_active => ping,
            _ => stats.last_active,
        };
        now.saturating_duration_since(last_seen)
    }

    pub fn mark_ping_ok(&self) {
        self.stats.lock().expect("worker mutex poisoned").last_ping_ok = Some(Instant::now());
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.stats.lock().expect("worker mutex poisoned").close_reason.clone()
    }

    /// Returns false when the worker was already closed.
    pub fn close(&self, reason: &str) -> bool {
        if self.closed.send_replace(true) {
            return false;
        }
        let (processed, outstanding) = {
            let mut stats = self.stats.lock().expect("worker mutex poisoned");
            stats.close_reason = Some(reason.to_string());
            (stats.processed, stats.outstanding)
        };
        drop(self.lease.lock().expect("worker mutex poisoned").take());

        let ip = self.info.ip();
        self.ctx.tracker.report_closed(ip, reason);
        metrics::record_worker_closed(reason);
        tracing::debug!(
            worker = %self.info.id,
            ip = %ip,
            protocol = %self.info.protocol,
            reason,
            processed,
            outstanding,
            age_secs = self.info.age(Instant::now()).as_secs(),
            "Worker closed"
        );
        let _ = self.ctx.events.send(WorkerEvent::Closed {
            id: self.info.id,
            ip,
            reason: reason.to_string(),
        });
        true
    }

    /// Close after a response body failed mid-stream.
    ///
    /// The connection driver usually sees the hangup first and closes the
    /// worker under its own reason, so the down-fail penalty is reported
    /// separately in that case.
    pub fn close_down_fail(&self) {
        if !self.close("down_fail") {
            self.ctx.tracker.report_closed(self.info.ip(), "down_fail");
        }
    }

    pub fn status(&self, accept_task: bool) -> WorkerStatus {
        let score = self.score();
        let stats = self.stats.lock().expect("worker mutex poisoned");
        WorkerStatus {
            id: self.info.id,
            ip: self.info.ip(),
            sni: self.info.sni.clone(),
            protocol: self.info.protocol,
            score,
            outstanding: stats.outstanding,
            processed: stats.processed,
            consecutive_failures: stats.consecutive_failures,
            age_secs: self.info.age(Instant::now()).as_secs(),
            accept_task,
            closed: self.is_closed(),
        }
    }
}

/// Resolve once the worker behind `signal` is closed.
pub async fn wait_closed(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|closed| *closed).await;
}
