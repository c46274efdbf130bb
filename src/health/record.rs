//! Per-IP quality record.
//!
//! # Responsibilities
//! - Keep a bounded, ordered history of connect outcomes
//! - Track consecutive failures, cooldown timestamps and in-flight slots
//! - Compute the rolling quality score used to rank candidates

use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::TrackerConfig;
use crate::error::FailureKind;
use crate::net::connection::Protocol;

/// One entry of an IP's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success { handshake_ms: u64 },
    Failure(FailureKind),
    Closed(String),
}

/// Mutable state for one candidate IP.
#[derive(Debug, Clone)]
pub struct IpRecord {
    pub ip: IpAddr,
    /// First-seen order, used to break quality ties.
    pub seq: u64,
    history: VecDeque<Outcome>,
    history_len: usize,
    latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub down_fail: u32,
    pub last_down_fail: Option<Instant>,
    pub in_flight: usize,
    pub excluded: bool,
    pub protocol: Option<Protocol>,
    pub last_close_reason: Option<String>,
}

impl IpRecord {
    pub fn new(ip: IpAddr, seq: u64, history_len: usize) -> Self {
        Self {
            ip,
            seq,
            history: VecDeque::with_capacity(history_len),
            history_len: history_len.max(1),
            latency_ms: None,
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            down_fail: 0,
            last_down_fail: None,
            in_flight: 0,
            excluded: false,
            protocol: None,
            last_close_reason: None,
        }
    }

    fn push(&mut self, outcome: Outcome) {
        if self.history.len() == self.history_len {
            self.history.pop_front();
        }
        self.history.push_back(outcome);
    }

    pub fn history(&self) -> impl Iterator<Item = &Outcome> {
        self.history.iter()
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.latency_ms
    }

    pub fn record_success(&mut self, handshake_ms: u64, max_step_ms: u64, now: Instant) {
        // A single slow handshake on a good IP (packet loss) must not push it
        // to the back of the list, so increases are damped.
        self.latency_ms = Some(match self.latency_ms {
            Some(previous) if handshake_ms > previous.saturating_add(max_step_ms) => {
                previous + max_step_ms
            }
            _ => handshake_ms,
        });
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        self.push(Outcome::Success { handshake_ms });
    }

    /// Returns false when the failure was folded into a previous one.
    pub fn record_failure(&mut self, kind: FailureKind, now: Instant) -> bool {
        self.push(Outcome::Failure(kind));
        if kind == FailureKind::Trust {
            self.excluded = true;
            return true;
        }
        if let Some(last) = self.last_failure {
            if now.saturating_duration_since(last) < Duration::from_secs(1) {
                return false;
            }
        }
        self.consecutive_failures += 1;
        self.last_failure = Some(now);
        true
    }

    /// Record a failure without penalizing (local network is down).
    pub fn note_failure(&mut self, kind: FailureKind) {
        self.push(Outcome::Failure(kind));
    }

    pub fn record_closed(&mut self, reason: &str, down_fail: bool, now: Instant) {
        self.push(Outcome::Closed(reason.to_string()));
        self.last_close_reason = Some(reason.to_string());
        if down_fail {
            self.down_fail += 1;
            self.last_down_fail = Some(now);
        }
    }

    fn failure_ratio(&self) -> f64 {
        let (mut failures, mut total) = (0u32, 0u32);
        for outcome in &self.history {
            match outcome {
                Outcome::Success { .. } => total += 1,
                Outcome::Failure(_) => {
                    failures += 1;
                    total += 1;
                }
                Outcome::Closed(_) => {}
            }
        }
        if total == 0 {
            0.0
        } else {
            f64::from(failures) / f64::from(total)
        }
    }

    /// Rolling quality score in milliseconds; lower is better.
    pub fn quality(&self, config: &TrackerConfig) -> u64 {
        let latency = self.latency_ms.unwrap_or(config.unknown_latency_ms);
        let failures = u64::from(self.consecutive_failures) * 1_000;
        let ratio = (self.failure_ratio() * 1_000.0) as u64;
        let down = u64::from(self.down_fail) * 500;
        latency + failures + ratio + down
    }

    /// Whether the IP may be handed out for a new connection right now.
    pub fn is_eligible(&self, config: &TrackerConfig, now: Instant) -> bool {
        if self.excluded || self.in_flight >= config.max_in_flight_per_ip {
            return false;
        }

        if self.consecutive_failures > 0 {
            if let Some(failed_at) = self.last_failure {
                let succeeded_recently = self.last_success.is_some_and(|t| {
                    now.saturating_duration_since(t) < Duration::from_secs(config.recent_success_secs)
                });
                let cooldown = if succeeded_recently {
                    config.failure_cooldown_secs
                } else {
                    config.long_failure_cooldown_secs
                };
                if now.saturating_duration_since(failed_at) < Duration::from_secs(cooldown) {
                    return false;
                }
            }
        }

        if let Some(down_at) = self.last_down_fail {
            let cooldown = Duration::from_secs(config.down_fail_cooldown_secs);
            if now.saturating_duration_since(down_at) < cooldown {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> IpRecord {
        IpRecord::new("192.0.2.1".parse().unwrap(), 0, 4)
    }

    #[test]
    fn history_is_bounded_and_ordered() {
        let mut r = record();
        let now = Instant::now();
        for ms in [10, 20, 30, 40, 50] {
            r.record_success(ms, 500, now);
        }
        let kept: Vec<_> = r.history().cloned().collect();
        assert_eq!(
            kept,
            vec![
                Outcome::Success { handshake_ms: 20 },
                Outcome::Success { handshake_ms: 30 },
                Outcome::Success { handshake_ms: 40 },
                Outcome::Success { handshake_ms: 50 },
            ]
        );
    }

    #[test]
    fn latency_increase_is_damped() {
        let mut r = record();
        let now = Instant::now();
        r.record_success(300, 500, now);
        r.record_success(2_000, 500, now);
        assert_eq!(r.latency_ms(), Some(800));
        r.record_success(100, 500, now);
        assert_eq!(r.latency_ms(), Some(100));
    }

    #[test]
    fn failures_within_a_second_count_once() {
        let mut r = record();
        let now = Instant::now();
        assert!(r.record_failure(FailureKind::Reset, now));
        assert!(!r.record_failure(FailureKind::Reset, now + Duration::from_millis(200)));
        assert!(r.record_failure(FailureKind::Timeout, now + Duration::from_secs(2)));
        assert_eq!(r.consecutive_failures, 2);
    }

    #[test]
    fn failure_cooldown_depends_on_recent_success() {
        let config = TrackerConfig::default();
        let now = Instant::now();

        let mut recent = record();
        recent.record_success(100, 500, now);
        recent.record_failure(FailureKind::Reset, now);
        assert!(!recent.is_eligible(&config, now + Duration::from_secs(60)));
        assert!(recent.is_eligible(&config, now + Duration::from_secs(121)));

        let mut stale = record();
        stale.record_failure(FailureKind::Reset, now);
        assert!(!stale.is_eligible(&config, now + Duration::from_secs(121)));
        assert!(stale.is_eligible(&config, now + Duration::from_secs(1_801)));
    }

    #[test]
    fn quality_penalizes_failures() {
        let config = TrackerConfig::default();
        let now = Instant::now();
        let mut good = record();
        good.record_success(200, 500, now);
        let mut bad = record();
        bad.record_success(100, 500, now);
        bad.record_failure(FailureKind::Timeout, now);
        assert!(good.quality(&config) < bad.quality(&config));
    }
}
