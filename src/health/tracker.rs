//! IP quality tracker.
//!
//! # Responsibilities
//! - Hold one [`IpRecord`] per candidate frontend IP
//! - Hand out the best eligible candidate as a [`CandidateLease`]
//! - Fold connect, close and protocol reports into each record
//!
//! # Design Decisions
//! - One mutex over all records; nothing is awaited while it is held
//! - The in-flight slot lives in the lease, so it is released exactly once
//!   however the connect attempt or the connection ends
//! - Trust failures exclude an IP for the rest of the process run

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::time::Instant;

use crate::config::TrackerConfig;
use crate::error::FailureKind;
use crate::health::network::LocalNetwork;
use crate::health::record::{IpRecord, Outcome};
use crate::net::connection::Protocol;

/// Close reasons that mean a response body died mid-transfer.
pub const DOWN_FAIL_REASONS: &[&str] = &["down_fail"];

#[derive(Debug, Default)]
struct TrackerState {
    records: HashMap<IpAddr, IpRecord>,
    next_seq: u64,
}

impl TrackerState {
    fn entry(&mut self, ip: IpAddr, history_len: usize) -> &mut IpRecord {
        let next_seq = &mut self.next_seq;
        self.records.entry(ip).or_insert_with(|| {
            let record = IpRecord::new(ip, *next_seq, history_len);
            *next_seq += 1;
            record
        })
    }
}

/// Ranks candidate IPs and tracks their outcomes.
#[derive(Debug)]
pub struct IpQualityTracker {
    config: TrackerConfig,
    network: Arc<LocalNetwork>,
    state: Mutex<TrackerState>,
}

impl IpQualityTracker {
    pub fn new(config: TrackerConfig, network: Arc<LocalNetwork>) -> Self {
        Self {
            config,
            network,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn network(&self) -> &Arc<LocalNetwork> {
        &self.network
    }

    /// Feed candidate IPs. Already known IPs keep their record.
    pub fn add_candidates<I>(&self, ips: I) -> usize
    where
        I: IntoIterator<Item = IpAddr>,
    {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        let before = state.records.len();
        for ip in ips {
            state.entry(ip, self.config.history_len);
        }
        let added = state.records.len() - before;
        if added > 0 {
            tracing::debug!(added, total = state.records.len(), "Candidates added");
        }
        added
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().expect("tracker mutex poisoned").records.len()
    }

    /// Best-quality eligible IP, with its in-flight slot taken.
    pub fn get_candidate(self: &Arc<Self>) -> Option<CandidateLease> {
        let now = Instant::now();
        let mut state = self.state.lock().expect("tracker mutex poisoned");

        let ip = state
            .records
            .values()
            .filter(|r| r.is_eligible(&self.config, now))
            .min_by_key(|r| (r.quality(&self.config), r.seq))
            .map(|r| r.ip)?;

        if let Some(record) = state.records.get_mut(&ip) {
            record.in_flight += 1;
        }

        Some(CandidateLease {
            ip,
            tracker: Arc::clone(self),
            released: false,
        })
    }

    pub fn report_success(&self, ip: IpAddr, handshake_ms: u64) {
        {
            let mut state = self.state.lock().expect("tracker mutex poisoned");
            let record = state.entry(ip, self.config.history_len);
            record.record_success(handshake_ms, self.config.max_latency_step_ms, Instant::now());
        }
        self.network.report_ok(ip);
    }

    pub fn report_failure(&self, ip: IpAddr, kind: FailureKind) {
        let network_ok = self.network.is_ok();
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        let record = state.entry(ip, self.config.history_len);

        if kind == FailureKind::Trust {
            record.record_failure(kind, Instant::now());
            tracing::warn!(ip = %ip, "IP excluded after certificate trust failure");
            return;
        }

        if !network_ok {
            record.note_failure(kind);
            tracing::debug!(ip = %ip, kind = %kind, "Failure not counted, local network down");
            return;
        }

        if record.record_failure(kind, Instant::now()) {
            tracing::debug!(
                ip = %ip,
                kind = %kind,
                consecutive = record.consecutive_failures,
                "Connect failure recorded"
            );
        }
    }

    /// Record why a connection from `ip` was closed.
    pub fn report_closed(&self, ip: IpAddr, reason: &str) {
        let down_fail = DOWN_FAIL_REASONS.contains(&reason);
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        state
            .entry(ip, self.config.history_len)
            .record_closed(reason, down_fail, Instant::now());
    }

    pub fn report_protocol(&self, ip: IpAddr, protocol: Protocol) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        state.entry(ip, self.config.history_len).protocol = Some(protocol);
    }

    pub fn protocol(&self, ip: IpAddr) -> Option<Protocol> {
        let state = self.state.lock().expect("tracker mutex poisoned");
        state.records.get(&ip).and_then(|r| r.protocol)
    }

    pub fn snapshot(&self, ip: IpAddr) -> Option<IpSnapshot> {
        let state = self.state.lock().expect("tracker mutex poisoned");
        state.records.get(&ip).map(|r| IpSnapshot::from_record(r, &self.config))
    }

    /// All records, best quality first.
    pub fn snapshots(&self) -> Vec<IpSnapshot> {
        let state = self.state.lock().expect("tracker mutex poisoned");
        let mut out: Vec<_> = state
            .records
            .values()
            .map(|r| (r.seq, IpSnapshot::from_record(r, &self.config)))
            .collect();
        out.sort_by_key(|(seq, s)| (s.quality, *seq));
        out.into_iter().map(|(_, s)| s).collect()
    }

    fn release(&self, ip: IpAddr) {
        let mut state = self.state.lock().expect("tracker mutex poisoned");
        if let Some(record) = state.records.get_mut(&ip) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
    }
}

/// Read-only view of one IP record.
#[derive(Debug, Clone, Serialize)]
pub struct IpSnapshot {
    pub ip: IpAddr,
    pub quality: u64,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub down_fail: u32,
    pub in_flight: usize,
    pub excluded: bool,
    pub protocol: Option<Protocol>,
    pub last_close_reason: Option<String>,
    pub history: Vec<Outcome>,
}

impl IpSnapshot {
    fn from_record(record: &IpRecord, config: &TrackerConfig) -> Self {
        Self {
            ip: record.ip,
            quality: record.quality(config),
            latency_ms: record.latency_ms(),
            consecutive_failures: record.consecutive_failures,
            down_fail: record.down_fail,
            in_flight: record.in_flight,
            excluded: record.excluded,
            protocol: record.protocol,
            last_close_reason: record.last_close_reason.clone(),
            history: record.history().cloned().collect(),
        }
    }
}

/// In-flight slot on a candidate IP. Released on drop.
#[derive(Debug)]
pub struct CandidateLease {
    ip: IpAddr,
    tracker: Arc<IpQualityTracker>,
    released: bool,
}

impl CandidateLease {
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn tracker(&self) -> &Arc<IpQualityTracker> {
        &self.tracker
    }
}

impl Drop for CandidateLease {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.tracker.release(self.ip);
        }
    }
}
