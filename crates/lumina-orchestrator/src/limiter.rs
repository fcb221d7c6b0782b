//! Per-credential rate limiting.
//!
//! Each credential owns one [`CredentialRateLimiter`]. A caller reserves the
//! next free slot under a short lock, then sleeps outside the lock until that
//! slot arrives. Concurrent callers on the same credential therefore queue up
//! one `min_interval` apart.

use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct LimiterState {
    /// Start time of the most recently reserved slot.
    last_request: Option<Instant>,
    total_wait: Duration,
    requests: u64,
    successes: u64,
    failures: u64,
}

/// Point-in-time copy of a limiter's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimiterSnapshot {
    /// Slots handed out.
    pub requests: u64,
    /// Calls recorded as successful.
    pub successes: u64,
    /// Calls recorded as failed.
    pub failures: u64,
    /// Cumulative time callers spent waiting for a slot.
    pub total_wait: Duration,
}

/// Minimum-interval gate for one credential.
#[derive(Debug)]
pub struct CredentialRateLimiter {
    credential_id: String,
    min_interval: Duration,
    state: Mutex<LimiterState>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Computes `window / ceiling + margin`.
///
/// A zero ceiling is treated as one request per window.
pub fn min_interval(window: Duration, ceiling: u32, margin: Duration) -> Duration {
    window / ceiling.max(1) + margin
}

impl CredentialRateLimiter {
    /// Creates a limiter enforcing `min_interval` between requests.
    pub fn new(credential_id: impl Into<String>, min_interval: Duration) -> Self {
        Self {
            credential_id: credential_id.into(),
            min_interval,
            state: Mutex::new(LimiterState::default()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Creates a limiter for `ceiling` requests per `window`.
    pub fn for_ceiling(
        credential_id: impl Into<String>,
        window: Duration,
        ceiling: u32,
        margin: Duration,
    ) -> Self {
        Self::new(credential_id, min_interval(window, ceiling, margin))
    }

    /// Minimum spacing between two accepted requests.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until this credential may issue its next request and returns
    /// how long the caller waited.
    pub async fn acquire(&self) -> Duration {
        let now = Instant::now();
        let slot = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = match state.last_request {
                Some(last) => (last + self.min_interval).max(now),
                None => now,
            };
            state.last_request = Some(slot);
            state.requests += 1;
            state.total_wait += slot - now;
            slot
        };

        let wait = slot - now;
        if !wait.is_zero() {
            debug!(
                credential = %self.credential_id,
                wait_ms = wait.as_millis() as u64,
                "Rate limiter waiting"
            );
            tokio::time::sleep_until(slot).await;
        }
        wait
    }

    /// Records the outcome of a request issued after [`acquire`](Self::acquire).
    pub fn record(&self, success: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if success {
            state.successes += 1;
        } else {
            state.failures += 1;
        }
    }

    /// Marks a remote call as in flight until the returned guard drops.
    pub fn begin_call(&self) -> InFlightGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlightGuard { limiter: self }
    }

    /// Highest number of simultaneous in-flight calls observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Copies the counters.
    pub fn snapshot(&self) -> LimiterSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        LimiterSnapshot {
            requests: state.requests,
            successes: state.successes,
            failures: state.failures,
            total_wait: state.total_wait,
        }
    }
}

/// Decrements the in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    limiter: &'a CredentialRateLimiter,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.limiter.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_min_interval_formula() {
        let window = Duration::from_secs(60);
        let margin = Duration::from_secs(1);
        assert_eq!(min_interval(window, 10, margin), Duration::from_secs(7));
        assert_eq!(min_interval(window, 2, margin), Duration::from_secs(31));
        assert_eq!(min_interval(window, 0, margin), Duration::from_secs(61));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_does_not_wait() {
        let limiter = CredentialRateLimiter::new("k", Duration::from_secs(7));
        assert_eq!(limiter.acquire().await, Duration::ZERO);
        assert_eq!(limiter.snapshot().requests, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_acquires_are_spaced() {
        let limiter = CredentialRateLimiter::for_ceiling(
            "k",
            Duration::from_secs(60),
            10,
            Duration::from_secs(1),
        );
        let start = Instant::now();
        for _ in 0..4 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() >= Duration::from_secs(21));
        assert_eq!(limiter.snapshot().total_wait, Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_get_distinct_slots() {
        let limiter = Arc::new(CredentialRateLimiter::new("k", Duration::from_secs(5)));
        let start = Instant::now();

        let handles: Vec<_> = (0..3)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await;
                    start.elapsed()
                })
            })
            .collect();

        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap());
        }
        finished.sort();
        assert!(finished[1] - finished[0] >= Duration::from_secs(5));
        assert!(finished[2] - finished[1] >= Duration::from_secs(5));
    }

    #[test]
    fn test_in_flight_guard_tracks_peak() {
        let limiter = CredentialRateLimiter::new("k", Duration::ZERO);
        {
            let _a = limiter.begin_call();
            let _b = limiter.begin_call();
        }
        let _c = limiter.begin_call();
        assert_eq!(limiter.peak_in_flight(), 2);
    }

    #[test]
    fn test_record_outcomes() {
        let limiter = CredentialRateLimiter::new("k", Duration::ZERO);
        limiter.record(true);
        limiter.record(false);
        limiter.record(true);
        let snapshot = limiter.snapshot();
        assert_eq!(snapshot.successes, 2);
        assert_eq!(snapshot.failures, 1);
    }
}
