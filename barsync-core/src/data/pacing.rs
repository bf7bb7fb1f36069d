//! Call pacing and bounded retries for upstream requests.
//!
//! Every provider call, from every worker, passes through one shared
//! [`RateLimiter`]. The limiter holds the timestamp of the last call behind a
//! mutex and sleeps while holding it, so calls are serialized and the
//! aggregate call rate stays under `1 / min_interval` regardless of how many
//! workers are running.

use super::provider::ProviderError;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// A provider call that failed after exhausting its attempts, or was rejected for a bad token.
#[derive(Debug, Clone, Error)]
#[error("call failed after {attempts} attempt(s): {last_error}")]
pub struct CallFailure {
    pub attempts: u32,
    #[source]
    pub last_error: ProviderError,
}

/// Shared pacing gate plus retry driver.
#[derive(Debug)]
pub struct RateLimiter {
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
}

impl RateLimiter {
    /// Create a limiter that keeps at least `min_interval` between calls.
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last_call: Mutex::new(None),
            min_interval,
        }
    }

    /// Minimum delay enforced between two calls.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    fn lock_last_call(&self) -> MutexGuard<'_, Option<Instant>> {
        self.last_call.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until this caller may issue the next upstream call.
    pub fn wait_turn(&self) {
        let mut last = self.lock_last_call();
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }

    /// Run `op` through the pacing gate with up to `attempts` tries.
    ///
    /// Every provider error is retried until the budget runs out, except a
    /// rejected token, which returns at once. Each attempt waits its turn at
    /// the gate, so retries are paced like any other call.
    pub fn call<T, F>(&self, attempts: u32, label: &str, mut op: F) -> Result<T, CallFailure>
    where
        F: FnMut() -> Result<T, ProviderError>,
    {
        let attempts = attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.wait_turn();
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(call = label, attempt, max_attempts = attempts, error = %err, "provider call failed, retrying");
                }
                Err(err) => {
                    tracing::error!(call = label, attempt, error = %err, "provider call failed");
                    return Err(CallFailure {
                        attempts: attempt,
                        last_error: err,
                    });
                }
            }
        }
    }
}

impl Default for RateLimiter {
    /// 120 ms between calls, matching the provider's default per-minute quota.
    fn default() -> Self {
        Self::new(Duration::from_millis(120))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn first_call_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(5));
        let t = Instant::now();
        limiter.wait_turn();
        assert!(t.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn consecutive_calls_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let t = Instant::now();
        limiter.wait_turn();
        limiter.wait_turn();
        limiter.wait_turn();
        assert!(t.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn gate_is_shared_across_threads() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(10)));
        let t = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let l = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    for _ in 0..3 {
                        l.wait_turn();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        // 12 calls through one gate → at least 11 intervals.
        assert!(t.elapsed() >= Duration::from_millis(110));
    }

    #[test]
    fn retries_until_success() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result = limiter.call(3, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(ProviderError::Timeout("slow".into()))
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_budget_reports_last_error() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = limiter.call(2, "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(ProviderError::NetworkUnreachable(format!("attempt {n}")))
        });
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 2);
        assert!(failure.last_error.to_string().contains("attempt 2"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn malformed_response_is_retried() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = limiter.call(3, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::ResponseFormat("truncated body".into()))
        });
        assert_eq!(result.unwrap_err().attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rejected_token_is_not_retried() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = limiter.call(5, "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::AuthenticationRequired("bad token".into()))
        });
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let limiter = RateLimiter::new(Duration::ZERO);
        let result = limiter.call(0, "test", || Ok::<_, ProviderError>(7));
        assert_eq!(result.unwrap(), 7);
    }
}
