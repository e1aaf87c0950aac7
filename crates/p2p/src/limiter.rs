//! Token-bucket rate limiting for sync workers and server admission.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A token bucket with a fixed refill rate and burst capacity.
///
/// The balance may go negative: [`TokenBucket::reserve`] always deducts, and
/// the debt is paid down by the refill before later acquisitions succeed.
/// This is how a worker charges one failed exchange as many requests, and
/// how the server counts a first-contact request without stalling it.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    /// Tokens currently available. Negative when in debt.
    tokens: f64,
    /// Maximum tokens the bucket accumulates.
    burst: f64,
    /// Refill rate, tokens per second.
    rate: f64,
    /// Last refill timestamp.
    refreshed: Instant,
}

impl TokenBucket {
    /// A bucket refilling at `rate` tokens per second, starting full.
    pub(crate) fn new(rate: f64, burst: u32) -> Self {
        Self {
            tokens: burst as f64,
            burst: burst as f64,
            rate,
            refreshed: Instant::now(),
        }
    }

    /// A bucket earning one token per `interval`, starting full.
    pub(crate) fn per(interval: Duration, burst: u32) -> Self {
        Self::new(1.0 / interval.as_secs_f64(), burst)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refreshed);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.burst);
        self.refreshed = now;
    }

    /// Deduct `n` tokens immediately, regardless of availability.
    pub(crate) fn reserve(&mut self, n: u32) {
        self.refill(Instant::now());
        self.tokens -= n as f64;
    }

    /// Take `n` tokens if available, or return how long until they will be.
    ///
    /// `n` must not exceed the burst; larger costs are expressed as debt
    /// via [`TokenBucket::reserve`].
    pub(crate) fn try_acquire(&mut self, n: u32) -> Result<(), Duration> {
        debug_assert!(n as f64 <= self.burst, "acquisition larger than burst");
        self.refill(Instant::now());
        let need = n as f64;
        if self.tokens >= need {
            self.tokens -= need;
            Ok(())
        } else {
            Err(Duration::from_secs_f64((need - self.tokens) / self.rate))
        }
    }

    /// Wait until `n` tokens are available and take them.
    ///
    /// Returns `false` if the token is cancelled before the tokens are.
    pub(crate) async fn acquire(&mut self, n: u32, cancel: &CancellationToken) -> bool {
        loop {
            match self.try_acquire(n) {
                Ok(()) => return true,
                Err(wait) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }
}

/// Wait for `n` tokens from a bucket shared across tasks.
///
/// The lock is held only to inspect and update the bucket, never across a
/// sleep. Contending waiters re-check after waking; the loop converges
/// because every pass either acquires or sleeps for the current shortfall.
pub(crate) async fn acquire_shared(bucket: &Mutex<TokenBucket>, n: u32) {
    loop {
        let wait = match bucket.lock().try_acquire(n) {
            Ok(()) => return,
            Err(wait) => wait,
        };
        tokio::time::sleep(wait).await;
    }
}
