//! `RateLimiter` — per-`(family, config-name)` pacing to stay under upstream
//! RPM caps (spec §4.3).
//!
//! Admits at most `floor(rpm_limit * 0.9)` requests in any trailing 60s
//! window. Admission is FIFO: callers queue on a single async mutex so the
//! first caller to arrive is the first one readmitted once the window has
//! room, and a cancelled waiter simply drops its place in line, waking the
//! next one — no separate wake-up bookkeeping needed.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const WINDOW: Duration = Duration::from_secs(60);

/// A single limiter instance, keyed externally by `(family, config-name)`.
pub struct RateLimiter {
    cap: Option<u32>,
    /// Holding this mutex *is* the FIFO queue position: whoever acquires it
    /// next is the next request in line to be admitted.
    admission: Mutex<VecDeque<Instant>>,
}

#[derive(Debug, thiserror::Error)]
#[error("rate limiter admission wait was cancelled")]
pub struct AdmissionCancelled;

impl RateLimiter {
    pub fn new(cap: Option<u32>) -> Self {
        Self {
            cap,
            admission: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until admission is granted, or until `cancel` fires.
    pub async fn admit(&self, cancel: &CancellationToken) -> Result<(), AdmissionCancelled> {
        let Some(cap) = self.cap else {
            return Ok(());
        };
        let mut timestamps = tokio::select! {
            guard = self.admission.lock() => guard,
            _ = cancel.cancelled() => return Err(AdmissionCancelled),
        };

        loop {
            let now = Instant::now();
            while let Some(&front) = timestamps.front() {
                if now.duration_since(front) >= WINDOW {
                    timestamps.pop_front();
                } else {
                    break;
                }
            }

            if timestamps.len() < cap as usize {
                timestamps.push_back(now);
                return Ok(());
            }

            let oldest = *timestamps.front().expect("cap > 0 implies non-empty when full");
            let wait_until = oldest + WINDOW;

            tokio::select! {
                _ = tokio::time::sleep_until(wait_until.into()) => continue,
                _ = cancel.cancelled() => return Err(AdmissionCancelled),
            }
        }
    }
}

/// Registry of limiters keyed by `(family, config-name)`. Limiter state is
/// discarded when a config is removed or renamed (spec §4.3): callers just
/// stop referencing the old key and a fresh limiter is created under the new
/// name on first use.
pub struct RateLimiterRegistry {
    limiters: Mutex<HashMap<(String, String), Arc<RateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self {
            limiters: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or lazily create) the limiter for `(family, name)` with the given
    /// effective cap. If a limiter already exists under this key but the cap
    /// changed, it is replaced — the window resizes on next admission.
    pub async fn get(&self, family: &str, name: &str, effective_cap: Option<u32>) -> Arc<RateLimiter> {
        let key = (family.to_string(), name.to_string());
        let mut limiters = self.limiters.lock().await;
        match limiters.get(&key) {
            Some(limiter) if limiter.cap == effective_cap => limiter.clone(),
            _ => {
                let limiter = Arc::new(RateLimiter::new(effective_cap));
                limiters.insert(key, limiter.clone());
                limiter
            }
        }
    }

    /// Drop the limiter for a removed or renamed config.
    pub async fn remove(&self, family: &str, name: &str) {
        let key = (family.to_string(), name.to_string());
        self.limiters.lock().await.remove(&key);
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_limit_admits_immediately() {
        let limiter = RateLimiter::new(None);
        let cancel = CancellationToken::new();
        for _ in 0..100 {
            limiter.admit(&cancel).await.unwrap();
        }
    }

    #[tokio::test]
    async fn admits_up_to_cap_without_blocking() {
        let limiter = RateLimiter::new(Some(3));
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.admit(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_past_cap_until_window_rolls() {
        let limiter = Arc::new(RateLimiter::new(Some(1)));
        let cancel = CancellationToken::new();
        limiter.admit(&cancel).await.unwrap();

        let limiter2 = limiter.clone();
        let cancel2 = cancel.clone();
        let handle = tokio::spawn(async move { limiter2.admit(&cancel2).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!handle.is_finished());

        tokio::time::sleep(WINDOW).await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancellation_releases_the_wait() {
        let limiter = Arc::new(RateLimiter::new(Some(1)));
        let cancel = CancellationToken::new();
        limiter.admit(&cancel).await.unwrap();

        let limiter2 = limiter.clone();
        let waiter_cancel = CancellationToken::new();
        let waiter_cancel2 = waiter_cancel.clone();
        let handle = tokio::spawn(async move { limiter2.admit(&waiter_cancel2).await });

        tokio::task::yield_now().await;
        waiter_cancel.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_err());
    }
}
