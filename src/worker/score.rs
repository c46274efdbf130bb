//! Worker score, in milliseconds. Lower is better.

use std::time::Duration;

/// Added per in-flight stream on top of the latency scaling.
pub const STREAM_PENALTY_MS: u64 = 60;
/// Added per consecutive failed task.
pub const FAILURE_PENALTY_MS: u64 = 1_000;
/// Weight of the RTT history in the moving average, out of 8.
const RTT_HISTORY_WEIGHT: u64 = 7;

#[derive(Debug, Clone, Copy)]
pub struct ScoreInput {
    pub rtt_ms: u64,
    pub outstanding: usize,
    pub age: Duration,
    pub consecutive_failures: u32,
}

pub fn compute(input: ScoreInput) -> u64 {
    let outstanding = input.outstanding as u64;
    let load = input.rtt_ms.saturating_mul(1 + outstanding);
    let streams = outstanding * STREAM_PENALTY_MS;
    // One millisecond per ten seconds of age: older sockets are nearer to
    // being recycled by the front end.
    let age = input.age.as_secs() / 10;
    let failures = u64::from(input.consecutive_failures) * FAILURE_PENALTY_MS;
    load + streams + age + failures
}

/// Fold a new round-trip sample into the moving average.
pub fn update_rtt(previous_ms: u64, sample: Duration) -> u64 {
    let sample_ms = sample.as_millis() as u64;
    (previous_ms * RTT_HISTORY_WEIGHT + sample_ms) / 8
}
