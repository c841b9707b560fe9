//! Quarantine of persistently failing feeds.
//!
//! Each fetch failure is appended to the feed's failure log. Once the number
//! of failures inside the rolling window reaches the threshold, the feed is
//! dropped together with its subscriptions and every former subscriber gets
//! one removal notice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::QuarantineConfig;
use crate::db::Database;
use crate::feed::{Feed, SubscriptionStore};
use crate::notify::Notifier;
use crate::{RelayError, Result};

/// Default rolling window (12 hours).
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(12 * 60 * 60);

/// Default number of failures within the window that drops a feed.
pub const DEFAULT_THRESHOLD: u32 = 9;

/// When a failing feed should be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuarantinePolicy {
    /// Failures older than this are not counted.
    pub window: Duration,
    /// Failures within the window that trigger a drop. Zero disables dropping.
    pub threshold: u32,
}

impl QuarantinePolicy {
    /// Create a policy.
    pub fn new(window: Duration, threshold: u32) -> Self {
        Self { window, threshold }
    }

    /// Whether `recent_failures` within the window warrant dropping the feed.
    pub fn should_drop(&self, recent_failures: i64) -> bool {
        self.threshold != 0 && recent_failures >= i64::from(self.threshold)
    }
}

impl Default for QuarantinePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_THRESHOLD)
    }
}

impl From<&QuarantineConfig> for QuarantinePolicy {
    fn from(config: &QuarantineConfig) -> Self {
        Self::new(Duration::from_secs(config.window_secs), config.threshold)
    }
}

/// What happened to a feed after a failure was recorded.
#[derive(Debug)]
pub enum QuarantineOutcome {
    /// The failure was logged; the feed stays.
    Recorded {
        /// Failures within the window, including this one.
        failures: i64,
    },
    /// The feed was dropped.
    Dropped {
        /// Destinations that were subscribed.
        destinations: Vec<i64>,
        /// Task sending the removal notices.
        notices: JoinHandle<()>,
    },
}

impl QuarantineOutcome {
    /// Whether the feed was dropped.
    pub fn is_dropped(&self) -> bool {
        matches!(self, QuarantineOutcome::Dropped { .. })
    }
}

/// Applies a [`QuarantinePolicy`] to fetch failures.
pub struct Quarantine {
    db: Arc<Database>,
    notifier: Arc<dyn Notifier>,
    policy: QuarantinePolicy,
}

impl Quarantine {
    /// Create a new quarantine.
    pub fn new(db: Arc<Database>, notifier: Arc<dyn Notifier>, policy: QuarantinePolicy) -> Self {
        Self {
            db,
            notifier,
            policy,
        }
    }

    /// The policy in effect.
    pub fn policy(&self) -> QuarantinePolicy {
        self.policy
    }

    /// Record a fetch failure of `feed` and drop it when the policy says so.
    ///
    /// Notices go to exactly the destinations whose subscriptions the drop
    /// deleted.
    pub async fn on_fetch_failure(
        &self,
        feed: &Feed,
        error: &str,
    ) -> Result<QuarantineOutcome> {
        let store = SubscriptionStore::new(self.db.pool());

        store.record_fetch_failure(feed.id, error).await?;

        let window = chrono::Duration::from_std(self.policy.window)
            .unwrap_or_else(|_| chrono::Duration::hours(12));
        let failures = store
            .count_recent_fetch_failures(feed.id, Utc::now() - window)
            .await?;

        if !self.policy.should_drop(failures) {
            debug!(
                "Feed {} has {} failure(s) in window (threshold {})",
                feed.id, failures, self.policy.threshold
            );
            return Ok(QuarantineOutcome::Recorded { failures });
        }

        let Some(destinations) = store.drop_feed(feed.id).await? else {
            return Err(RelayError::NotFound(format!("feed {}", feed.id)));
        };

        warn!(
            "Dropped feed {} ({}) after {} failures; notifying {} destination(s)",
            feed.id,
            feed.url,
            failures,
            destinations.len()
        );

        let notices = self.spawn_notices(feed, destinations.clone());

        Ok(QuarantineOutcome::Dropped {
            destinations,
            notices,
        })
    }

    fn spawn_notices(&self, feed: &Feed, destinations: Vec<i64>) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.notifier);
        let text = removal_notice(feed);
        let feed_id = feed.id;

        tokio::spawn(async move {
            for destination in destinations {
                if let Err(e) = notifier.send(destination, &text).await {
                    warn!(
                        "Failed to notify destination {} about removal of feed {}: {}",
                        destination, feed_id, e
                    );
                }
            }
            info!("Removal notices for feed {} sent", feed_id);
        })
    }
}

/// Text sent to destinations of a dropped feed.
pub fn removal_notice(feed: &Feed) -> String {
    let name = if feed.title.is_empty() {
        feed.url.as_str()
    } else {
        feed.title.as_str()
    };
    format!(
        "The feed \"{}\" ({}) was removed from this chat because it failed repeatedly.",
        name, feed.url
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::temp_db;
    use crate::notify::ChannelNotifier;

    #[test]
    fn test_should_drop() {
        let policy = QuarantinePolicy::default();
        assert_eq!(policy.window, Duration::from_secs(43_200));
        assert!(!policy.should_drop(0));
        assert!(!policy.should_drop(8));
        assert!(policy.should_drop(9));
        assert!(policy.should_drop(20));
    }

    #[test]
    fn test_zero_threshold_never_drops() {
        let policy = QuarantinePolicy::new(DEFAULT_WINDOW, 0);
        assert!(!policy.should_drop(0));
        assert!(!policy.should_drop(i64::MAX));
    }

    #[test]
    fn test_removal_notice_names_feed() {
        let feed = Feed {
            id: 1,
            url: "https://example.com/feed".into(),
            title: "Example".into(),
        };
        let text = removal_notice(&feed);
        assert!(text.contains("Example"));
        assert!(text.contains("https://example.com/feed"));
    }

    #[tokio::test]
    async fn test_drop_at_threshold() {
        let (_dir, db) = temp_db().await;
        let db = Arc::new(db);
        let store = SubscriptionStore::new(db.pool());
        let feed = store.add_subscription(1, 100, "a.example/feed", "A").await.unwrap();
        store.add_subscription(2, 200, "a.example/feed", "A").await.unwrap();

        let (notifier, mut rx) = ChannelNotifier::new(8);
        let quarantine = Quarantine::new(
            Arc::clone(&db),
            Arc::new(notifier),
            QuarantinePolicy::new(DEFAULT_WINDOW, 3),
        );

        for expected in 1..=2 {
            match quarantine.on_fetch_failure(&feed, "timeout").await.unwrap() {
                QuarantineOutcome::Recorded { failures } => assert_eq!(failures, expected),
                other => panic!("unexpected {:?}", other),
            }
        }

        match quarantine.on_fetch_failure(&feed, "timeout").await.unwrap() {
            QuarantineOutcome::Dropped {
                mut destinations,
                notices,
            } => {
                destinations.sort();
                assert_eq!(destinations, vec![100, 200]);
                notices.await.unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(store.get_feed(feed.id).await.unwrap().is_none());
        let mut notified = vec![rx.recv().await.unwrap().destination, rx.recv().await.unwrap().destination];
        notified.sort();
        assert_eq!(notified, vec![100, 200]);
    }
}
