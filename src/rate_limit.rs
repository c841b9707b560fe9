//! Request throttling backed by the request log.
//!
//! Every accepted command is appended to the `requests` table. An owner who
//! already issued the configured number of requests within the window is
//! declined until the oldest of them ages out.

use std::time::Duration;

use chrono::Utc;

use crate::config::RequestsConfig;
use crate::db::{begin_immediate, DbPool};
use crate::Result;

/// Configuration for request throttling.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Maximum requests allowed in the time window. Zero means unlimited.
    pub max_requests: u32,
    /// Time window for counting requests.
    pub window: Duration,
}

impl RateLimitConfig {
    /// Create a new rate limit configuration.
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }

    /// Whether throttling is switched off.
    pub fn is_unlimited(&self) -> bool {
        self.max_requests == 0
    }
}

impl From<&RequestsConfig> for RateLimitConfig {
    fn from(config: &RequestsConfig) -> Self {
        Self::new(config.max_per_window, config.window_secs)
    }
}

/// Result of a rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is allowed.
    Allowed,
    /// Request is denied due to rate limit.
    Denied {
        /// Time until the oldest counted request leaves the window.
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Check if the request is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed)
    }
}

/// Per-owner request limiter.
pub struct RequestLimiter<'a> {
    pool: &'a DbPool,
    config: RateLimitConfig,
}

impl<'a> RequestLimiter<'a> {
    /// Create a new limiter.
    pub fn new(pool: &'a DbPool, config: RateLimitConfig) -> Self {
        Self { pool, config }
    }

    /// Check the owner's budget and log the request when allowed.
    ///
    /// Denied requests are not logged.
    pub async fn check_and_record(
        &self,
        owner: i64,
        name: &str,
        text: &str,
    ) -> Result<RateLimitResult> {
        let now = Utc::now().timestamp();
        let mut tx = begin_immediate(self.pool).await?;

        if !self.config.is_unlimited() {
            let cutoff = now - self.config.window.as_secs() as i64;
            let (count, oldest): (i64, Option<i64>) = sqlx::query_as(
                r#"
                SELECT COUNT(*), MIN(created_at)
                FROM requests
                WHERE owner_id = $1 AND created_at > $2
                "#,
            )
            .bind(owner)
            .bind(cutoff)
            .fetch_one(&mut *tx)
            .await?;

            if count >= i64::from(self.config.max_requests) {
                let oldest = oldest.unwrap_or(now);
                let elapsed = Duration::from_secs(now.saturating_sub(oldest).max(0) as u64);
                let retry_after = self.config.window.saturating_sub(elapsed);
                return Ok(RateLimitResult::Denied { retry_after });
            }
        }

        sqlx::query("INSERT INTO requests (owner_id, created_at, name, text) VALUES ($1, $2, $3, $4)")
            .bind(owner)
            .bind(now)
            .bind(name)
            .bind(text)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(RateLimitResult::Allowed)
    }

    /// Number of requests the owner issued within the window.
    pub async fn recent_requests(&self, owner: i64) -> Result<i64> {
        let cutoff = Utc::now().timestamp() - self.config.window.as_secs() as i64;
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM requests WHERE owner_id = $1 AND created_at > $2",
        )
        .bind(owner)
        .bind(cutoff)
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::temp_db;

    #[test]
    fn test_rate_limit_config() {
        let config = RateLimitConfig::new(5, 60);
        assert_eq!(config.max_requests, 5);
        assert_eq!(config.window, Duration::from_secs(60));
        assert!(!config.is_unlimited());
        assert!(RateLimitConfig::new(0, 60).is_unlimited());
    }

    #[tokio::test]
    async fn test_allows_under_limit() {
        let (_dir, db) = temp_db().await;
        let limiter = RequestLimiter::new(db.pool(), RateLimitConfig::new(3, 60));

        for _ in 0..3 {
            let result = limiter.check_and_record(1, "feeds", "").await.unwrap();
            assert!(result.is_allowed());
        }
        assert_eq!(limiter.recent_requests(1).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_denies_over_limit() {
        let (_dir, db) = temp_db().await;
        let limiter = RequestLimiter::new(db.pool(), RateLimitConfig::new(2, 60));

        assert!(limiter.check_and_record(1, "feeds", "").await.unwrap().is_allowed());
        assert!(limiter.check_and_record(1, "feeds", "").await.unwrap().is_allowed());

        match limiter.check_and_record(1, "feeds", "").await.unwrap() {
            RateLimitResult::Denied { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
            }
            RateLimitResult::Allowed => panic!("Expected Denied"),
        }
        // Denied requests are not logged
        assert_eq!(limiter.recent_requests(1).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_separate_owners() {
        let (_dir, db) = temp_db().await;
        let limiter = RequestLimiter::new(db.pool(), RateLimitConfig::new(1, 60));

        assert!(limiter.check_and_record(1, "help", "").await.unwrap().is_allowed());
        assert!(!limiter.check_and_record(1, "help", "").await.unwrap().is_allowed());
        assert!(limiter.check_and_record(2, "help", "").await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_unlimited_still_logs() {
        let (_dir, db) = temp_db().await;
        let limiter = RequestLimiter::new(db.pool(), RateLimitConfig::new(0, 60));

        for _ in 0..50 {
            assert!(limiter.check_and_record(1, "feeds", "").await.unwrap().is_allowed());
        }
        assert_eq!(limiter.recent_requests(1).await.unwrap(), 50);
    }
}
