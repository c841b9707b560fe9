//! Feed, subscription and quota types.

use std::fmt;

use chrono::{DateTime, Utc};

/// A polled feed source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feed {
    /// Feed ID.
    pub id: i64,
    /// URL to fetch.
    pub url: String,
    /// Feed title as discovered on first subscription.
    pub title: String,
}

/// Row type for a feed from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub id: i64,
    pub url: String,
    pub title: String,
}

impl From<FeedRow> for Feed {
    fn from(row: FeedRow) -> Self {
        Feed {
            id: row.id,
            url: row.url,
            title: row.title,
        }
    }
}

/// A destination subscribed to a feed and the progress it has seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    /// Destination (chat) ID.
    pub destination_id: i64,
    /// Everything published up to this time has been delivered.
    pub last_update: DateTime<Utc>,
}

/// Row type for a subscriber from the database.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct SubscriberRow {
    pub destination_id: i64,
    pub last_update: i64,
}

impl From<SubscriberRow> for Subscriber {
    fn from(row: SubscriberRow) -> Self {
        Subscriber {
            destination_id: row.destination_id,
            last_update: from_unix(row.last_update),
        }
    }
}

/// A fetched and parsed feed document.
#[derive(Debug, Clone, Default)]
pub struct Document {
    /// Feed title.
    pub title: Option<String>,
    /// Feed-level update time, when the document declares one.
    pub updated_at: Option<DateTime<Utc>>,
    /// Items in document order.
    pub items: Vec<DocumentItem>,
}

impl Document {
    /// The point in time the document last changed.
    ///
    /// The feed-level update time wins; otherwise the newest item publish
    /// time. `None` means the document carries no freshness signal at all.
    pub fn freshness(&self) -> Option<DateTime<Utc>> {
        self.updated_at
            .or_else(|| self.items.iter().filter_map(|item| item.published_at).max())
    }

    /// Items published strictly after `since`, oldest first.
    ///
    /// Items without a publish time are never selected. Comparison is at
    /// whole-second precision, the precision progress markers are stored at.
    pub fn items_after(&self, since: DateTime<Utc>) -> Vec<&DocumentItem> {
        let since = since.timestamp();
        let mut items: Vec<&DocumentItem> = self
            .items
            .iter()
            .filter(|item| {
                item.published_at
                    .map(|published| published.timestamp() > since)
                    .unwrap_or(false)
            })
            .collect();
        items.sort_by_key(|item| item.published_at);
        items
    }
}

/// A single entry of a feed document.
#[derive(Debug, Clone, Default)]
pub struct DocumentItem {
    /// Item title.
    pub title: String,
    /// Item description (HTML stripped).
    pub description: Option<String>,
    /// Link to the original article.
    pub link: Option<String>,
    /// When the item was published.
    pub published_at: Option<DateTime<Utc>>,
}

impl DocumentItem {
    /// Create an item with a title and publish time.
    pub fn new(title: impl Into<String>, published_at: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            published_at: Some(published_at),
            ..Default::default()
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Set the link.
    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    /// The message delivered for this item.
    pub fn message_text(&self) -> String {
        let mut text = self.title.clone();
        if let Some(description) = self.description.as_deref().filter(|d| !d.is_empty()) {
            text.push('\n');
            text.push_str(description);
        }
        if let Some(link) = &self.link {
            text.push_str("\n\nLink: ");
            text.push_str(link);
        }
        text
    }
}

/// Which admission quota declined a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// The destination already holds the maximum number of subscriptions.
    DestinationLimit,
    /// The owner already introduced the maximum number of feeds.
    OwnerTotalLimit,
    /// The owner already holds the maximum number of subscriptions.
    OwnerActiveLimit,
}

impl QuotaKind {
    /// Get string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::DestinationLimit => "chat is already at maximum feeds",
            QuotaKind::OwnerTotalLimit => "user has added the maximum number of feeds",
            QuotaKind::OwnerActiveLimit => "user has the maximum number of active feeds",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Current counters the admission quotas are checked against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, sqlx::FromRow)]
pub struct QuotaUsage {
    /// Subscriptions held by the destination.
    pub destination_feeds: i64,
    /// Feeds introduced by the owner.
    pub owner_total_feeds: i64,
    /// Subscriptions held by the owner.
    pub owner_active_feeds: i64,
}

/// Admission limits. Zero means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaLimits {
    /// Maximum subscriptions per destination.
    pub max_feeds_per_destination: u32,
    /// Maximum feeds introduced per owner.
    pub max_total_feeds_by_owner: u32,
    /// Maximum subscriptions per owner.
    pub max_active_feeds_by_owner: u32,
}

impl QuotaLimits {
    /// Limits that never decline.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// The first quota `usage` has reached, in priority order.
    pub fn check(&self, usage: &QuotaUsage) -> Option<QuotaKind> {
        let reached = |limit: u32, count: i64| limit != 0 && count >= i64::from(limit);

        if reached(self.max_feeds_per_destination, usage.destination_feeds) {
            Some(QuotaKind::DestinationLimit)
        } else if reached(self.max_total_feeds_by_owner, usage.owner_total_feeds) {
            Some(QuotaKind::OwnerTotalLimit)
        } else if reached(self.max_active_feeds_by_owner, usage.owner_active_feeds) {
            Some(QuotaKind::OwnerActiveLimit)
        } else {
            None
        }
    }
}

/// Normalize a feed URL into its identity key.
///
/// The scheme is dropped so `http://` and `https://` name the same source.
pub fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let lower = url.to_ascii_lowercase();
    for scheme in ["https://", "http://"] {
        if lower.starts_with(scheme) {
            return url[scheme.len()..].to_string();
        }
    }
    url.to_string()
}

/// Convert a timestamp to stored UNIX seconds.
pub(crate) fn to_unix(t: DateTime<Utc>) -> i64 {
    t.timestamp()
}

/// Convert stored UNIX seconds to a timestamp.
pub(crate) fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
