use sqlx::PgPool;
use std::time::Duration;

use super::{Acquire, RateLimiter};
use crate::error::InfraError;
use crate::{boxed, BoxFuture};

/// Sliding window shared by every process on the same database.
///
/// Each check runs in one transaction holding an advisory lock on the key, so
/// concurrent checks for a key are serialized.
#[derive(Clone)]
pub struct PgRateLimiter {
    pool: PgPool,
    retention: Duration,
}

impl PgRateLimiter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retention: Duration::from_secs(60),
        }
    }

    /// Events older than this are removed by [`RateLimiter::purge_expired`].
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub async fn check(&self, key: &str, limit: u32, window: Duration) -> Result<Acquire, InfraError> {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(key)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM rate_limit_events
            WHERE key = $1
              AND at <= clock_timestamp() - ($2::bigint * interval '1 millisecond')
            "#,
        )
        .bind(key)
        .bind(window_ms)
        .execute(&mut *tx)
        .await?;

        let in_window: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM rate_limit_events WHERE key = $1")
                .bind(key)
                .fetch_one(&mut *tx)
                .await?;

        if in_window < i64::from(limit) {
            sqlx::query("INSERT INTO rate_limit_events (key) VALUES ($1)")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Acquire::allowed());
        }

        let retry_ms: Option<f64> = sqlx::query_scalar(
            r#"
            SELECT (EXTRACT(EPOCH FROM (
                MIN(at) + ($2::bigint * interval '1 millisecond') - clock_timestamp()
            )) * 1000)::float8
            FROM rate_limit_events
            WHERE key = $1
            "#,
        )
        .bind(key)
        .bind(window_ms)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        let retry_after = retry_ms
            .filter(|ms| ms.is_finite() && *ms > 0.0)
            .map(|ms| Duration::from_micros((ms * 1000.0) as u64))
            .unwrap_or(window);
        Ok(Acquire::refused(retry_after.max(Duration::from_millis(1))))
    }

    pub async fn purge(&self) -> Result<u64, InfraError> {
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let res = sqlx::query(
            r#"
            DELETE FROM rate_limit_events
            WHERE at < clock_timestamp() - ($1::bigint * interval '1 millisecond')
            "#,
        )
        .bind(retention_ms)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}

impl RateLimiter for PgRateLimiter {
    fn try_acquire<'a>(
        &'a self,
        key: &'a str,
        limit: u32,
        window: Duration,
    ) -> BoxFuture<'a, Result<Acquire, InfraError>> {
        boxed(self.check(key, limit, window))
    }

    fn purge_expired<'a>(&'a self) -> BoxFuture<'a, Result<u64, InfraError>> {
        boxed(self.purge())
    }
}
