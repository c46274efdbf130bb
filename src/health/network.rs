//! Local network health.
//!
//! Distinguishes "this IP is bad" from "our own link is down". While the
//! link looks broken, connect failures are not held against candidate IPs
//! and pool fillers back off harder.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Consecutive-failure based link monitor.
#[derive(Debug)]
pub struct LocalNetwork {
    fail_threshold: u32,
    consecutive_failures: AtomicU32,
}

impl LocalNetwork {
    pub fn new(fail_threshold: u32) -> Self {
        Self {
            fail_threshold: fail_threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) < self.fail_threshold
    }

    /// A handshake with `ip` completed, so the link works.
    pub fn report_ok(&self, ip: IpAddr) {
        let previous = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if previous >= self.fail_threshold {
            tracing::info!(ip = %ip, "Local network recovered");
        }
    }

    pub fn report_fail(&self, ip: IpAddr) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == self.fail_threshold {
            tracing::warn!(ip = %ip, failures, "Local network looks down");
        }
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_and_recovery() {
        let ip: IpAddr = "198.51.100.1".parse().unwrap();
        let net = LocalNetwork::new(2);
        assert!(net.is_ok());
        net.report_fail(ip);
        assert!(net.is_ok());
        net.report_fail(ip);
        assert!(!net.is_ok());
        net.report_ok(ip);
        assert!(net.is_ok());
    }
}
