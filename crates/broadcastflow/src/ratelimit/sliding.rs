use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::{Acquire, RateLimiter};
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

#[derive(Debug)]
struct Window {
    /// Admission instants, oldest first.
    stamps: VecDeque<Instant>,
    span: Duration,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.stamps.front() {
            if now.saturating_duration_since(*oldest) >= self.span {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Process-local sliding-window limiter on the tokio clock.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Synchronous form of [`RateLimiter::try_acquire`].
    pub fn check(&self, key: &str, limit: u32, window: Duration) -> Acquire {
        let now = Instant::now();
        let mut windows = self.lock();
        let entry = windows.entry(key.to_string()).or_insert_with(|| Window {
            stamps: VecDeque::new(),
            span: window,
        });
        entry.span = window;
        entry.prune(now);

        if (entry.stamps.len() as u64) < u64::from(limit) {
            entry.stamps.push_back(now);
            return Acquire::allowed();
        }

        let retry_after = match entry.stamps.front() {
            Some(oldest) => (*oldest + window).saturating_duration_since(now),
            None => window,
        };
        Acquire::refused(retry_after.max(Duration::from_millis(1)))
    }

    pub fn purge(&self) -> u64 {
        let now = Instant::now();
        let mut windows = self.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.prune(now);
            !w.stamps.is_empty()
        });
        (before - windows.len()) as u64
    }

    pub fn tracked_keys(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        limit: u32,
        window: Duration,
    ) -> BoxFuture<'a, Result<Acquire, InfraError>> {
        boxed(async move { Ok(self.check(key, limit, window)) })
    }

    fn purge_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>> {
        boxed(async move { Ok(self.purge()) })
    }
}
