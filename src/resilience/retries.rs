//! Retry logic.
//!
//! # Responsibilities
//! - Decide whether a failed task goes back to the queue
//! - Enforce the per-task retry cap and the task's own deadline
//!
//! # Design Decisions
//! - A task whose response already started reaching the caller is never
//!   re-issued: a second response would be spliced onto the first
//! - Connection errors are retried on a different connection, so no delay
//!   is applied here

use std::time::Duration;

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the task.
    Retry,
    /// Fail the task with this reason.
    Fail(String),
}

/// Inputs to a retry decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryState {
    pub delivered: bool,
    pub retry_count: u32,
    pub elapsed: Duration,
    pub timeout: Duration,
    pub running: bool,
}

pub fn decide(state: RetryState, max_retries: u32) -> RetryDecision {
    if state.delivered {
        return RetryDecision::Fail("response already delivered".to_string());
    }
    if state.retry_count >= max_retries {
        return RetryDecision::Fail(format!("retry count exceeded {max_retries}"));
    }
    if state.elapsed >= state.timeout {
        return RetryDecision::Fail(format!("retry timeout after {}ms", state.elapsed.as_millis()));
    }
    if !state.running {
        return RetryDecision::Fail("retry but stopped".to_string());
    }
    RetryDecision::Retry
}
