//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Calculate exponential backoff delay with jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

/// Delay before a pool filler retries after a failed connect.
///
/// While the local link looks broken the delay jumps to the cap: retrying
/// other IPs cannot help until the network comes back.
pub fn connect_backoff(consecutive_failures: u32, network_ok: bool, base_ms: u64, max_ms: u64) -> Duration {
    if network_ok {
        calculate_backoff(consecutive_failures, base_ms, max_ms)
    } else {
        calculate_backoff(consecutive_failures.max(1), max_ms, max_ms)
    }
}
