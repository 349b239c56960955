//! Per-provider call guards: token-bucket rate limiting, a hard timeout,
//! and a circuit breaker.
//!
//! Every external provider call goes through a [`ProviderGuard`]. The guard
//! classifies failures into the [`ProviderError`] taxonomy; the task runtime
//! decides retry behavior from the classification.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::traits::ProviderError;

// =============================================================================
// Token bucket
// =============================================================================

/// Token bucket with fractional refill. `capacity` tokens burst, refilled at
/// `refill_per_sec`.
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rps: f32) -> Self {
        let refill_per_sec = f64::from(rps).max(0.01);
        let capacity = refill_per_sec.max(1.0);
        Self {
            capacity,
            refill_per_sec,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, waiting for refill if the bucket is empty.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self
                    .state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let now = Instant::now();
                let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                state.last_refill = now;

                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.refill_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

/// Opens after `threshold` consecutive transport failures; half-opens after
/// `cooldown`.
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Returns an error while the circuit is open.
    pub fn check(&self, provider: &str) -> Result<(), ProviderError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(opened_at) = state.opened_at {
            if opened_at.elapsed() < self.cooldown {
                return Err(ProviderError::Unavailable(format!(
                    "{provider} circuit open"
                )));
            }
            // Half-open: allow the next call through as a probe.
            state.opened_at = None;
        }
        Ok(())
    }

    pub fn record_success(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
        }
    }
}

// =============================================================================
// Provider guard
// =============================================================================

/// Combines timeout, token bucket, and circuit breaker in front of one
/// provider. Stateless from the caller's perspective aside from its buckets.
pub struct ProviderGuard {
    name: String,
    timeout: Duration,
    bucket: TokenBucket,
    breaker: CircuitBreaker,
}

impl ProviderGuard {
    pub fn new(name: impl Into<String>, rps: f32, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            timeout,
            bucket: TokenBucket::new(rps),
            breaker: CircuitBreaker::new(5, Duration::from_secs(30)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one provider call under the guard.
    pub async fn call<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: std::future::Future<Output = Result<T, ProviderError>>,
    {
        self.breaker.check(&self.name)?;
        self.bucket.acquire().await;

        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(ProviderError::Transient(format!(
                "{} call timed out after {:?}",
                self.name, self.timeout
            ))),
        };

        match &result {
            Ok(_) => self.breaker.record_success(),
            // Only transport-level failures trip the breaker; a permanent
            // error means the provider is up but rejected this request.
            Err(ProviderError::Transient(_)) | Err(ProviderError::Unavailable(_)) => {
                self.breaker.record_failure()
            }
            Err(_) => {}
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_throttles() {
        let bucket = TokenBucket::new(2.0);

        // Burst capacity of 2 drains instantly.
        bucket.acquire().await;
        bucket.acquire().await;

        // Third token requires ~500ms of refill; paused time auto-advances.
        let start = Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        assert!(breaker.check("test").is_ok());

        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.check("test").is_ok());

        breaker.record_failure();
        assert!(matches!(
            breaker.check("test"),
            Err(ProviderError::Unavailable(_))
        ));
    }

    #[test]
    fn breaker_resets_on_success() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert!(breaker.check("test").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn guard_times_out_slow_calls() {
        let guard = ProviderGuard::new("slow", 100.0, Duration::from_millis(50));
        let result: Result<(), _> = guard
            .call(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Transient(_))));
    }

    #[tokio::test]
    async fn guard_passes_through_success() {
        let guard = ProviderGuard::new("ok", 100.0, Duration::from_secs(1));
        let result = guard.call(async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
