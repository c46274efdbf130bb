//! Connection pool subsystem.
//!
//! # Data Flow
//! ```text
//! Supervisor (manager.rs):
//!     size + connecting < min, or acquirers waiting
//!     → spawn connect attempt (semaphore bounded)
//!     → tracker.get_candidate → connector.connect → put
//!
//! Consumer:
//!     acquire(block, timeout, protocol) → fastest handshake first
//!
//! Sweep:
//!     every sweep interval → close unclaimed past first-use timeout
//! ```
//!
//! # Design Decisions
//! - Handshake time orders the pool; it is the best latency signal we
//!   have before a request has been sent
//! - store.rs is lock-free plain data so it can be tested directly

pub mod manager;
pub mod store;

pub use manager::{ConnectionPool, PoolState, PoolStatus};
