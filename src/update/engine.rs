//! Periodic update passes.
//!
//! A pass walks every feed, fetches it, and delivers the items each
//! subscriber has not seen yet in publish order. A subscriber's progress is
//! advanced after every delivered item, so an interrupted pass never loses
//! or repeats more than the item in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, Duration, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::quarantine::{Quarantine, QuarantinePolicy};
use crate::config::Config;
use crate::db::Database;
use crate::feed::{Document, Feed, FeedSource, Subscriber, SubscriptionStore};
use crate::notify::Notifier;
use crate::shutdown::StopSignal;
use crate::{RelayError, Result};

/// Default time between passes (1 hour).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Default time budget of a single pass (1 minute).
pub const DEFAULT_PASS_TIMEOUT: Duration = Duration::from_secs(60);

/// Summary of a completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Feeds visited.
    pub feeds: usize,
    /// Feeds whose fetch failed.
    pub failed_feeds: usize,
    /// Feeds dropped by quarantine.
    pub dropped_feeds: usize,
    /// Messages delivered.
    pub delivered: usize,
}

/// Feed update engine.
pub struct FeedUpdater {
    db: Arc<Database>,
    source: Arc<dyn FeedSource>,
    notifier: Arc<dyn Notifier>,
    quarantine: Quarantine,
    interval: Duration,
    pass_timeout: Duration,
    run_at_startup: bool,
}

impl FeedUpdater {
    /// Create an updater with default settings.
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn FeedSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let quarantine = Quarantine::new(
            Arc::clone(&db),
            Arc::clone(&notifier),
            QuarantinePolicy::default(),
        );
        Self {
            db,
            source,
            notifier,
            quarantine,
            interval: DEFAULT_INTERVAL,
            pass_timeout: DEFAULT_PASS_TIMEOUT,
            run_at_startup: true,
        }
    }

    /// Create an updater from configuration.
    pub fn from_config(
        db: Arc<Database>,
        source: Arc<dyn FeedSource>,
        notifier: Arc<dyn Notifier>,
        config: &Config,
    ) -> Self {
        Self::new(db, source, notifier)
            .with_interval(config.update.interval())
            .with_pass_timeout(config.update.pass_timeout())
            .with_run_at_startup(config.update.run_at_startup)
            .with_policy(QuarantinePolicy::from(&config.quarantine))
    }

    /// Set the time between passes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the time budget of a pass.
    pub fn with_pass_timeout(mut self, timeout: Duration) -> Self {
        self.pass_timeout = timeout;
        self
    }

    /// Whether the first pass runs immediately or after one interval.
    pub fn with_run_at_startup(mut self, run_at_startup: bool) -> Self {
        self.run_at_startup = run_at_startup;
        self
    }

    /// Set the quarantine policy.
    pub fn with_policy(mut self, policy: QuarantinePolicy) -> Self {
        self.quarantine = Quarantine::new(
            Arc::clone(&self.db),
            Arc::clone(&self.notifier),
            policy,
        );
        self
    }

    /// Run passes on a fixed schedule until `stop` fires.
    ///
    /// Passes never overlap; ticks missed during a slow pass are skipped.
    pub async fn run(&self, stop: StopSignal) {
        info!(
            "Feed updater started (interval: {} seconds, pass timeout: {} seconds)",
            self.interval.as_secs(),
            self.pass_timeout.as_secs()
        );

        let mut timer = if self.run_at_startup {
            interval(self.interval)
        } else {
            interval_at(Instant::now() + self.interval, self.interval)
        };
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => break,
                _ = timer.tick() => {}
            }

            match self.run_pass(&stop).await {
                Ok(report) => info!(
                    "Update pass finished: {} feed(s), {} failed, {} dropped, {} message(s) delivered",
                    report.feeds, report.failed_feeds, report.dropped_feeds, report.delivered
                ),
                Err(RelayError::Cancelled) => {
                    info!("Update pass interrupted by shutdown");
                    break;
                }
                Err(RelayError::DeadlineExceeded) => {
                    warn!(
                        "Update pass exceeded its {} second budget",
                        self.pass_timeout.as_secs()
                    );
                }
                Err(e) => error!("Update pass failed: {}", e),
            }
        }

        info!("Feed updater stopped");
    }

    /// Run one pass over every feed.
    ///
    /// Fails with [`RelayError::DeadlineExceeded`] when the pass budget runs
    /// out and [`RelayError::Cancelled`] on shutdown. Progress recorded
    /// before that point stays valid.
    pub async fn run_pass(&self, stop: &StopSignal) -> Result<PassReport> {
        let stop = stop.with_timeout(self.pass_timeout);
        let store = SubscriptionStore::new(self.db.pool());
        let mut report = PassReport::default();

        debug!("Starting update pass");
        let mut feeds = store.list_all_feeds(stop.clone()).await?;

        while let Some(feed) = feeds.next().await {
            report.feeds += 1;

            let (document, freshness) = match self.fetch(&feed, &stop).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    if stop.is_stopped() {
                        return Err(stop.stop_error());
                    }
                    warn!("Failed to fetch feed {} ({}): {}", feed.id, feed.url, e);
                    report.failed_feeds += 1;

                    match self
                        .quarantine
                        .on_fetch_failure(&feed, &e.to_string())
                        .await
                    {
                        Ok(outcome) if outcome.is_dropped() => report.dropped_feeds += 1,
                        Ok(_) => {}
                        Err(e) if e.is_stop() => return Err(e),
                        Err(e) => error!("Failed to record failure of feed {}: {}", feed.id, e),
                    }
                    continue;
                }
            };

            if let Err(e) = store.clear_fetch_failures(feed.id).await {
                error!("Failed to clear failures of feed {}: {}", feed.id, e);
            }

            let mut subscribers = match store
                .list_subscribers(feed.id, freshness, stop.clone())
                .await
            {
                Ok(cursor) => cursor,
                Err(e) if e.is_stop() => return Err(e),
                Err(e) => {
                    error!("Failed to list subscribers of feed {}: {}", feed.id, e);
                    continue;
                }
            };

            while let Some(subscriber) = subscribers.next().await {
                report.delivered += self
                    .deliver(&store, &feed, &document, &subscriber, &stop)
                    .await?;
            }

            if stop.is_stopped() {
                return Err(stop.stop_error());
            }
        }

        if stop.is_stopped() {
            return Err(stop.stop_error());
        }

        Ok(report)
    }

    /// Fetch a feed and determine its freshness.
    ///
    /// A document without any timestamp counts as a failed fetch.
    async fn fetch(&self, feed: &Feed, stop: &StopSignal) -> Result<(Document, DateTime<Utc>)> {
        let document = stop
            .guard(self.source.fetch(&feed.url, stop.deadline()))
            .await?;

        let freshness = document
            .freshness()
            .ok_or_else(|| RelayError::Fetch("feed has no timestamp".to_string()))?;

        Ok((document, freshness))
    }

    /// Deliver unseen items to one subscriber, returning how many were sent.
    async fn deliver(
        &self,
        store: &SubscriptionStore<'_>,
        feed: &Feed,
        document: &Document,
        subscriber: &Subscriber,
        stop: &StopSignal,
    ) -> Result<usize> {
        let items = document.items_after(subscriber.last_update);
        if items.is_empty() {
            return Ok(0);
        }

        debug!(
            "{} new item(s) of feed {} for destination {} since {}",
            items.len(),
            feed.id,
            subscriber.destination_id,
            subscriber.last_update
        );

        let mut delivered = 0;
        for item in items {
            let Some(published) = item.published_at else {
                continue;
            };

            let sent = stop
                .guard(self.notifier.send(subscriber.destination_id, &item.message_text()))
                .await;
            if let Err(e) = sent {
                if e.is_stop() {
                    return Err(e);
                }
                warn!(
                    "Failed to deliver feed {} to destination {}: {}",
                    feed.id, subscriber.destination_id, e
                );
                break;
            }
            delivered += 1;

            match store
                .advance_subscription(subscriber.destination_id, feed.id, published)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(
                        "Destination {} unsubscribed from feed {} during delivery",
                        subscriber.destination_id, feed.id
                    );
                    break;
                }
                Err(e) => {
                    error!(
                        "Failed to record progress of destination {} on feed {}: {}",
                        subscriber.destination_id, feed.id, e
                    );
                    break;
                }
            }

            if stop.is_stopped() {
                return Err(stop.stop_error());
            }
        }

        Ok(delivered)
    }
}

/// Start the updater as a background task.
pub fn start_updater(updater: FeedUpdater, stop: StopSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        updater.run(stop).await;
    })
}
