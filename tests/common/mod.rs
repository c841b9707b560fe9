//! Test helpers for integration tests.
//!
//! Provides an on-disk test database, a scripted feed source and a notifier
//! that records what it was asked to deliver.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tempfile::TempDir;
use tokio::time::Instant;

use feedrelay::{
    Database, Document, DocumentItem, FeedSource, Notifier, OutboundMessage, RelayError, Result,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a fresh database in a temporary directory.
///
/// Keep the returned directory alive for as long as the database is used.
pub async fn setup_test_db() -> (TempDir, Arc<Database>) {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("relay.db"), 5).await.unwrap();
    (dir, Arc::new(db))
}

/// A whole-second instant `hours` after a point safely in the future.
///
/// New subscriptions start at the current time, so items meant to be
/// delivered must be published later than that.
pub fn future(hours: i64) -> DateTime<Utc> {
    static BASE: OnceLock<DateTime<Utc>> = OnceLock::new();
    let base = BASE.get_or_init(|| {
        (Utc::now() + TimeDelta::days(1))
            .duration_trunc(TimeDelta::hours(1))
            .unwrap()
    });
    *base + TimeDelta::hours(hours)
}

/// A document whose freshness is its newest item.
pub fn document(title: &str, items: Vec<DocumentItem>) -> Document {
    Document {
        title: Some(title.to_string()),
        updated_at: None,
        items,
    }
}

/// An item with a link derived from its title.
pub fn item(title: &str, published_at: DateTime<Utc>) -> DocumentItem {
    DocumentItem::new(title, published_at)
        .with_description(format!("{} body", title))
        .with_link(format!("https://example.com/{}", title))
}

enum Scripted {
    Document(Document),
    Failure(String),
}

/// Feed source returning scripted documents per URL.
#[derive(Default)]
pub struct StaticFeedSource {
    feeds: Mutex<HashMap<String, Scripted>>,
    delays: Mutex<HashMap<String, Duration>>,
    fetches: Mutex<Vec<String>>,
}

impl StaticFeedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_document(&self, url: &str, document: Document) {
        self.feeds
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::Document(document));
    }

    pub fn set_failure(&self, url: &str, message: &str) {
        self.feeds
            .lock()
            .unwrap()
            .insert(url.to_string(), Scripted::Failure(message.to_string()));
    }

    /// Make fetches of `url` take `delay`.
    pub fn set_delay(&self, url: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(url.to_string(), delay);
    }

    /// URLs fetched so far, in order.
    pub fn fetches(&self) -> Vec<String> {
        self.fetches.lock().unwrap().clone()
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    async fn fetch(&self, url: &str, _deadline: Option<Instant>) -> Result<Document> {
        self.fetches.lock().unwrap().push(url.to_string());

        let delay = self.delays.lock().unwrap().get(url).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let feeds = self.feeds.lock().unwrap();
        match feeds.get(url) {
            Some(Scripted::Document(document)) => Ok(document.clone()),
            Some(Scripted::Failure(message)) => Err(RelayError::Fetch(message.clone())),
            None => Err(RelayError::Fetch(format!("HTTP error: 404 Not Found ({})", url))),
        }
    }
}

/// Notifier recording every delivered message.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<OutboundMessage>>,
    failing: Mutex<HashSet<i64>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every send to `destination` fail.
    pub fn fail_for(&self, destination: i64) {
        self.failing.lock().unwrap().insert(destination);
    }

    /// Let sends to `destination` succeed again.
    pub fn recover(&self, destination: i64) {
        self.failing.lock().unwrap().remove(&destination);
    }

    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts_for(&self, destination: i64) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|m| m.destination == destination)
            .map(|m| m.text)
            .collect()
    }

    /// Wait until at least `count` messages were delivered.
    pub async fn wait_for(&self, count: usize) {
        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        while self.count() < count {
            assert!(Instant::now() < deadline, "timed out waiting for {count} messages");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, destination: i64, text: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(&destination) {
            return Err(RelayError::Notify(format!("chat {} unreachable", destination)));
        }
        self.sent.lock().unwrap().push(OutboundMessage {
            destination,
            text: text.to_string(),
        });
        Ok(())
    }
}
