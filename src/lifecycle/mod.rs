//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (binary):
//!     Load config → Validate → Tracker → Pool (fillers, sweep) → Dispatcher
//!
//! Shutdown (shutdown.rs):
//!     Ctrl+C / stop() → keep-running flag cleared → loops exit
//!     → workers closed → pooled sockets closed
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then tracker, pool, dispatcher
//! - Cancellation is cooperative; in-flight socket calls end on their own timeouts

pub mod shutdown;

pub use shutdown::{Shutdown, ShutdownSignal};
