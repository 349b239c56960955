//! Durable task queue runtime: named queues, bounded worker pools,
//! ack-on-success, retry with backoff, dead-lettering.

pub mod queue;
pub mod registry;
pub mod task;
pub mod worker;

pub use queue::{FailureOutcome, PgTaskQueue, TaskQueue};
pub use registry::{SharedTaskRegistry, TaskRegistry};
pub use task::{Task, TaskErrorKind, TaskFailure, TaskStatus};
pub use worker::WorkerPool;

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with jitter: `base * 2^(attempt-1)`, capped, then
/// ±30 % jitter.
pub fn retry_backoff(attempt: i32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = (attempt - 1).clamp(0, 20) as u32;
    let raw = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
    let jitter = rand::rng().random_range(-0.3..=0.3);
    let jittered = (raw as f64 * (1.0 + jitter)).max(0.0);
    Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_within_jitter() {
        for _ in 0..100 {
            let first = retry_backoff(1, 1_000, 60_000).as_millis() as f64;
            assert!((700.0..=1_300.0).contains(&first), "got {first}");

            let third = retry_backoff(3, 1_000, 60_000).as_millis() as f64;
            assert!((2_800.0..=5_200.0).contains(&third), "got {third}");
        }
    }

    #[test]
    fn backoff_respects_cap() {
        for _ in 0..100 {
            let delay = retry_backoff(30, 1_000, 10_000).as_millis();
            assert!(delay <= 13_000);
        }
    }

    #[test]
    fn backoff_handles_zero_attempt() {
        let delay = retry_backoff(0, 1_000, 10_000).as_millis() as f64;
        assert!((700.0..=1_300.0).contains(&delay));
    }
}
