//! Bounded retry with exponential backoff, per-call deadlines, and a
//! shared leaky-bucket throttle for collaborator rate limits.

use crate::error::ServiceError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// How often and how patiently a collaborator call is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always >= 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Deadline applied to each individual attempt.
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// The last error of a call that did not succeed, with the number of
/// attempts spent on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempted {
    pub attempts: u32,
    pub error: ServiceError,
}

impl Attempted {
    /// True when every allowed attempt failed with a retryable error.
    pub fn exhausted(&self) -> bool {
        self.error.is_retryable()
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, without jitter.
    ///
    /// `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent.
    ///
    /// Each attempt is bounded by `call_timeout`; an elapsed deadline counts
    /// as a retryable [`ServiceError::Timeout`]. Quota errors wait the full
    /// `max_delay` before the next attempt.
    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, Attempted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.call_timeout, call()).await {
                Ok(r) => r,
                Err(_) => Err(ServiceError::Timeout(op.to_string())),
            };

            let error = match result {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if !error.is_retryable() || attempt >= max_attempts {
                if error.is_retryable() {
                    tracing::warn!(op, attempt, error = %error, "retries exhausted");
                }
                return Err(Attempted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = if error.is_quota() {
                self.max_delay
            } else {
                self.with_jitter(self.backoff(attempt))
            };
            tracing::debug!(op, attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying");
            tokio::time::sleep(delay).await;
        }
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        let spread = (delay.as_millis() as u64) / 4;
        if spread == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

/// Leaky-bucket throttle shared by concurrent workers calling one
/// collaborator. Each `acquire` reserves the next free slot.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl Throttle {
    /// Allow at most `per_second` calls per second. Zero disables throttling.
    pub fn per_second(per_second: u32) -> Self {
        let interval = if per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs(1) / per_second
        };
        Self {
            interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    pub async fn acquire(&self) {
        if self.interval.is_zero() {
            return;
        }
        let wait_until = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.interval;
            slot
        };
        tokio::time::sleep_until(wait_until).await;
    }

    /// Hold every caller back for `pause`, e.g. after a quota rejection.
    pub async fn pause(&self, pause: Duration) {
        let mut next = self.next_slot.lock().await;
        let resume = Instant::now() + pause;
        if resume > *next {
            *next = resume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(400));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(10), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out = policy(5)
            .run("op", || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ServiceError::Transient("503".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(out, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_exhausts_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), _> = policy(3)
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::Transient("503".into()))
                }
            })
            .await;
        let err = out.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let out: Result<(), _> = policy(5)
            .run("op", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(ServiceError::NotFound("collection".into()))
                }
            })
            .await;
        let err = out.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(!err.exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_times_out_slow_call() {
        let out: Result<(), _> = policy(2)
            .run("slow", || async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        let err = out.unwrap_err();
        assert_eq!(err.error, ServiceError::Timeout("slow".into()));
        assert_eq!(err.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_spaces_calls() {
        let throttle = Throttle::per_second(10);
        let start = Instant::now();
        for _ in 0..5 {
            throttle.acquire().await;
        }
        // First slot is immediate, the next four are 100ms apart.
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_pause_delays_next_acquire() {
        let throttle = Throttle::per_second(0);
        throttle.acquire().await;

        let throttle = Throttle::per_second(1000);
        throttle.pause(Duration::from_secs(2)).await;
        let start = Instant::now();
        throttle.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
