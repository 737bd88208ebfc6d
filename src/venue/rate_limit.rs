// =============================================================================
// Rate-Limit Coordinator — per-venue permits + exponential backoff with jitter
// =============================================================================
//
// The surrounding codebase tracked Binance's weight/order-count headers with
// atomic counters and a hard ceiling; this generalizes that idea to a venue
// the engine knows nothing about ahead of time — a bounded-concurrency
// semaphore per venue, plus retry-with-backoff for any call classified as
// rate-limited (HTTP 429 or a venue-specific "rate limit" rejection).

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::warn;

use crate::error::EngineError;

/// Immutable snapshot of a venue's current rate-limit posture, suitable for
/// exposing through the status surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub available_permits: u32,
    pub retries_so_far: u32,
}

/// Bounded-concurrency gate plus retry discipline for one venue.
pub struct VenueRateLimiter {
    semaphore: Semaphore,
    retries_so_far: AtomicU32,
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl VenueRateLimiter {
    /// `permits` bounds in-flight calls to this venue (default 2 for a
    /// strict venue, a larger number for a lenient one).
    pub fn new(permits: usize, initial_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            semaphore: Semaphore::new(permits),
            retries_so_far: AtomicU32::new(0),
            initial_delay,
            max_delay,
            max_retries,
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            available_permits: self.semaphore.available_permits() as u32,
            retries_so_far: self.retries_so_far.load(Ordering::Relaxed),
        }
    }

    /// Acquire this venue's permit, run `call`, and retry on rate-limited
    /// errors with exponential backoff (base `initial_delay`, factor 2, capped
    /// at `max_delay`, +/-25% jitter) up to `max_retries` times. Any
    /// non-rate-limit error propagates immediately.
    pub async fn run<F, Fut, T>(&self, mut call: F) -> Result<T, EngineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore never closed");

        let mut delay = self.initial_delay;
        let mut attempt = 0u32;

        loop {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_rate_limited() && attempt < self.max_retries => {
                    attempt += 1;
                    self.retries_so_far.fetch_add(1, Ordering::Relaxed);

                    let jitter_frac = rand::thread_rng().gen_range(-0.25..=0.25);
                    let jittered_ms =
                        (delay.as_millis() as f64 * (1.0 + jitter_frac)).max(0.0) as u64;

                    warn!(
                        attempt,
                        delay_ms = jittered_ms,
                        "rate-limited, backing off before retry"
                    );

                    tokio::time::sleep(Duration::from_millis(jittered_ms)).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Stagger the k-th future's start by `k * stagger` after the batch begins,
/// smoothing request bursts from a concurrent fan-out (e.g. the scanner)
/// while preserving overall concurrency.
pub async fn run_staggered<T, Fut, F>(items: Vec<T>, stagger: Duration, f: F) -> Vec<Fut::Output>
where
    F: Fn(T) -> Fut,
    Fut: Future,
{
    let tasks: Vec<_> = items
        .into_iter()
        .enumerate()
        .map(|(k, item)| {
            let fut = f(item);
            let delay = stagger * k as u32;
            async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                fut.await
            }
        })
        .collect();

    futures_util::future::join_all(tasks).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;
    use std::sync::Arc;

    #[tokio::test]
    async fn run_retries_on_rate_limit_then_succeeds() {
        let limiter = VenueRateLimiter::new(
            2,
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
        );
        let calls = Arc::new(Counter::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, EngineError> = limiter
            .run(|| {
                let calls2 = calls2.clone();
                async move {
                    let n = calls2.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(EngineError::RateLimited {
                            venue: "test",
                            retry_after_ms: 1,
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_propagates_non_rate_limit_errors_immediately() {
        let limiter = VenueRateLimiter::new(
            1,
            Duration::from_millis(1),
            Duration::from_millis(5),
            3,
        );
        let calls = Arc::new(Counter::new(0));
        let calls2 = calls.clone();

        let result: Result<u32, EngineError> = limiter
            .run(|| {
                let calls2 = calls2.clone();
                async move {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Auth { venue: "test" })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
