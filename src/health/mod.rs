//! Candidate IP health subsystem.
//!
//! # Data Flow
//! ```text
//! Candidate source:
//!     add_candidates → tracker.rs (one record.rs entry per IP)
//!
//! Pool filler:
//!     get_candidate → CandidateLease (in-flight slot)
//!     → connect → report_success / report_failure
//!
//! Worker close:
//!     report_closed(ip, reason) → history, down-fail penalty
//!
//! Local link (network.rs):
//!     consecutive connect failures → "network down"
//!     → failures no longer held against IPs
//! ```
//!
//! # Design Decisions
//! - Records are only down-ranked or excluded, never removed
//! - Quality is a latency-like number in milliseconds so penalties add up

pub mod network;
pub mod record;
pub mod tracker;

pub use network::LocalNetwork;
pub use record::{IpRecord, Outcome};
pub use tracker::{CandidateLease, IpQualityTracker, IpSnapshot};
