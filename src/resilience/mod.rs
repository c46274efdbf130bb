//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Connect attempt fails (pool filler):
//!     → backoff.rs (delay scaled by failures and local-network health)
//!
//! Task fails on a worker:
//!     → retries.rs (retry cap, task deadline, delivery state)
//!     → re-enqueue or terminal failure
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Jittered backoff prevents thundering herd against the candidate list

pub mod backoff;
pub mod retries;
