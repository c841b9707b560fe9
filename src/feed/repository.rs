//! Subscription store.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use tracing::{debug, info};

use super::types::{
    normalize_url, to_unix, Feed, FeedRow, QuotaLimits, QuotaUsage, Subscriber, SubscriberRow,
};
use crate::db::{begin_immediate, Cursor, DbPool};
use crate::shutdown::StopSignal;
use crate::{RelayError, Result};

/// Repository for feeds, subscriptions and the fetch failure log.
pub struct SubscriptionStore<'a> {
    pool: &'a DbPool,
    limits: QuotaLimits,
}

impl<'a> SubscriptionStore<'a> {
    /// Create a new store with unlimited admission.
    pub fn new(pool: &'a DbPool) -> Self {
        Self {
            pool,
            limits: QuotaLimits::unlimited(),
        }
    }

    /// Set the admission limits.
    pub fn with_limits(mut self, limits: QuotaLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Subscribe `destination` to the feed at `url` on behalf of `owner`.
    ///
    /// The quota check, the feed insert (for an unseen URL) and the
    /// subscription insert happen in one immediate transaction, so concurrent
    /// admissions never overshoot a limit. Any failure rolls everything back.
    pub async fn add_subscription(
        &self,
        owner: i64,
        destination: i64,
        url: &str,
        title: &str,
    ) -> Result<Feed> {
        let url = url.trim();
        if url.is_empty() {
            return Err(RelayError::Validation("feed URL is empty".into()));
        }
        let url_key = normalize_url(url);
        let now = to_unix(Utc::now());

        let mut tx = begin_immediate(self.pool).await?;

        let usage = sqlx::query_as::<_, QuotaUsage>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM subscriptions WHERE destination_id = $1) AS destination_feeds,
                (SELECT COUNT(*) FROM feeds WHERE created_by = $2) AS owner_total_feeds,
                (SELECT COUNT(*) FROM subscriptions WHERE owner_id = $2) AS owner_active_feeds
            "#,
        )
        .bind(destination)
        .bind(owner)
        .fetch_one(&mut *tx)
        .await?;

        if let Some(kind) = self.limits.check(&usage) {
            debug!(
                "Declined subscription of {} to {}: {} ({:?})",
                destination, url, kind, usage
            );
            return Err(RelayError::QuotaExceeded(kind));
        }

        let existing = sqlx::query_as::<_, FeedRow>(
            "SELECT id, url, title FROM feeds WHERE url_key = $1",
        )
        .bind(&url_key)
        .fetch_optional(&mut *tx)
        .await?;

        let feed = match existing {
            Some(row) => Feed::from(row),
            None => {
                let row = sqlx::query_as::<_, FeedRow>(
                    r#"
                    INSERT INTO feeds (url, url_key, title, created_by, created_at)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, url, title
                    "#,
                )
                .bind(url)
                .bind(&url_key)
                .bind(title)
                .bind(owner)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                info!("Created feed {} ({})", row.id, row.url);
                Feed::from(row)
            }
        };

        let already: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM subscriptions WHERE destination_id = $1 AND feed_id = $2",
        )
        .bind(destination)
        .bind(feed.id)
        .fetch_optional(&mut *tx)
        .await?;
        if already.is_some() {
            return Err(RelayError::Conflict(format!(
                "{} is already subscribed",
                feed.url
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO subscriptions (destination_id, feed_id, owner_id, last_update)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(destination)
        .bind(feed.id)
        .bind(owner)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            "Subscribed destination {} to feed {} (owner {})",
            destination, feed.id, owner
        );
        Ok(feed)
    }

    /// Remove the subscription at 1-based `ordinal` in `destination`'s list.
    ///
    /// Returns the unsubscribed feed, or `None` when the ordinal is out of
    /// range.
    pub async fn remove_subscription(
        &self,
        destination: i64,
        ordinal: i64,
    ) -> Result<Option<Feed>> {
        if ordinal < 1 {
            return Ok(None);
        }

        let mut tx = begin_immediate(self.pool).await?;

        let row = sqlx::query_as::<_, FeedRow>(
            r#"
            SELECT f.id, f.url, f.title
            FROM subscriptions s
            JOIN feeds f ON f.id = s.feed_id
            WHERE s.destination_id = $1
            ORDER BY s.id
            LIMIT 1 OFFSET $2
            "#,
        )
        .bind(destination)
        .bind(ordinal - 1)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM subscriptions WHERE destination_id = $1 AND feed_id = $2")
            .bind(destination)
            .bind(row.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!(
            "Unsubscribed destination {} from feed {} (position {})",
            destination, row.id, ordinal
        );
        Ok(Some(Feed::from(row)))
    }

    /// Stream `destination`'s feeds in ordinal order.
    pub async fn list_subscriptions(
        &self,
        destination: i64,
        stop: StopSignal,
    ) -> Result<Cursor<Feed>> {
        let pool = self.pool.clone();
        Cursor::spawn(stop, move |sink| async move {
            let rows = sqlx::query_as::<_, FeedRow>(
                r#"
                SELECT f.id, f.url, f.title
                FROM subscriptions s
                JOIN feeds f ON f.id = s.feed_id
                WHERE s.destination_id = $1
                ORDER BY s.id
                "#,
            )
            .bind(destination)
            .fetch(&pool)
            .map_ok(Feed::from);
            sink.drain(rows).await;
        })
        .await
    }

    /// Stream every feed.
    pub async fn list_all_feeds(&self, stop: StopSignal) -> Result<Cursor<Feed>> {
        let pool = self.pool.clone();
        Cursor::spawn(stop, move |sink| async move {
            let rows = sqlx::query_as::<_, FeedRow>("SELECT id, url, title FROM feeds ORDER BY id")
                .fetch(&pool)
                .map_ok(Feed::from);
            sink.drain(rows).await;
        })
        .await
    }

    /// Stream subscribers of `feed` whose progress is strictly before
    /// `not_after`.
    pub async fn list_subscribers(
        &self,
        feed: i64,
        not_after: DateTime<Utc>,
        stop: StopSignal,
    ) -> Result<Cursor<Subscriber>> {
        self.subscribers_before(feed, to_unix(not_after), stop).await
    }

    /// Stream every subscriber of `feed` regardless of progress.
    pub async fn list_all_subscribers(
        &self,
        feed: i64,
        stop: StopSignal,
    ) -> Result<Cursor<Subscriber>> {
        self.subscribers_before(feed, i64::MAX, stop).await
    }

    async fn subscribers_before(
        &self,
        feed: i64,
        not_after: i64,
        stop: StopSignal,
    ) -> Result<Cursor<Subscriber>> {
        let pool = self.pool.clone();
        Cursor::spawn(stop, move |sink| async move {
            let rows = sqlx::query_as::<_, SubscriberRow>(
                r#"
                SELECT destination_id, last_update
                FROM subscriptions
                WHERE feed_id = $1 AND last_update < $2
                ORDER BY id
                "#,
            )
            .bind(feed)
            .bind(not_after)
            .fetch(&pool)
            .map_ok(Subscriber::from);
            sink.drain(rows).await;
        })
        .await
    }

    /// Move `destination`'s progress on `feed` forward to `t`.
    ///
    /// Progress never moves backwards. Returns `false` when the subscription
    /// no longer exists.
    pub async fn advance_subscription(
        &self,
        destination: i64,
        feed: i64,
        t: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET last_update = MAX(last_update, $1)
            WHERE destination_id = $2 AND feed_id = $3
            "#,
        )
        .bind(to_unix(t))
        .bind(destination)
        .bind(feed)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Get a feed by ID.
    pub async fn get_feed(&self, id: i64) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedRow>("SELECT id, url, title FROM feeds WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(row.map(Feed::from))
    }

    /// Get a feed by URL. `http` and `https` forms match the same feed.
    pub async fn lookup_feed_by_url(&self, url: &str) -> Result<Option<Feed>> {
        let row = sqlx::query_as::<_, FeedRow>(
            "SELECT id, url, title FROM feeds WHERE url_key = $1",
        )
        .bind(normalize_url(url))
        .fetch_optional(self.pool)
        .await?;

        Ok(row.map(Feed::from))
    }

    /// Append a fetch failure for `feed`.
    pub async fn record_fetch_failure(&self, feed: i64, message: &str) -> Result<()> {
        sqlx::query("INSERT INTO feed_errors (feed_id, occurred_at, message) VALUES ($1, $2, $3)")
            .bind(feed)
            .bind(to_unix(Utc::now()))
            .bind(message)
            .execute(self.pool)
            .await?;
        Ok(())
    }

    /// Count fetch failures of `feed` at or after `since`.
    pub async fn count_recent_fetch_failures(
        &self,
        feed: i64,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM feed_errors WHERE feed_id = $1 AND occurred_at >= $2",
        )
        .bind(feed)
        .bind(to_unix(since))
        .fetch_one(self.pool)
        .await?;
        Ok(count)
    }

    /// Forget the failure history of `feed`.
    pub async fn clear_fetch_failures(&self, feed: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM feed_errors WHERE feed_id = $1")
            .bind(feed)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Delete `feed` together with its subscriptions and failure log.
    ///
    /// Returns the destinations whose subscriptions were deleted, or `None`
    /// when the feed did not exist.
    pub async fn drop_feed(&self, feed: i64) -> Result<Option<Vec<i64>>> {
        let mut tx = begin_immediate(self.pool).await?;

        let destinations: Vec<i64> = sqlx::query_scalar(
            "DELETE FROM subscriptions WHERE feed_id = $1 RETURNING destination_id",
        )
        .bind(feed)
        .fetch_all(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM feed_errors WHERE feed_id = $1")
            .bind(feed)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM feeds WHERE id = $1")
            .bind(feed)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        tx.commit().await?;
        debug!("Dropped feed {} with {} subscription(s)", feed, destinations.len());
        Ok(Some(destinations))
    }
}
