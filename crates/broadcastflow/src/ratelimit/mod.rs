//! Keyed sliding-window rate limiting.
//!
//! [`SlidingWindowLimiter`] keeps its window in process memory, so `n` worker
//! processes sharing one key can admit up to `n * limit` operations per window.
//! [`PgRateLimiter`] keeps the window in Postgres and holds the limit across
//! processes.

pub mod pg;
pub mod sliding;

use std::time::Duration;
use uuid::Uuid;

use crate::error::InfraError;
use crate::BoxFuture;

pub use pg::PgRateLimiter;
pub use sliding::SlidingWindowLimiter;

/// Answer to one acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquire {
    pub allowed: bool,
    /// Time until the oldest admitted operation leaves the window. Set only when refused.
    pub retry_after: Option<Duration>,
}

impl Acquire {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn refused(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after),
        }
    }
}

pub trait RateLimiter: Send + Sync {
    /// Admits one operation for `key` iff fewer than `limit` were admitted in
    /// the trailing `window`. A `limit` of zero admits nothing.
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        limit: u32,
        window: Duration,
    ) -> BoxFuture<'a, Result<Acquire, InfraError>>;

    /// Drops state of keys whose window has fully elapsed.
    fn purge_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>>;
}

/// Limiter key for outbound messages of a tenant.
pub fn tenant_messages_key(tenant_id: Uuid) -> String {
    format!("tenant:{tenant_id}:messages")
}
