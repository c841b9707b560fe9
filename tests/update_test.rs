//! Update engine tests for feedrelay.
//!
//! These tests drive full update passes against a scripted feed source and
//! check delivery order, progress tracking and re-run behavior.

mod common;

use std::sync::Arc;

use common::{document, future, item, setup_test_db, RecordingNotifier, StaticFeedSource};
use feedrelay::{FeedUpdater, StopSignal, SubscriptionStore};

const FEED_URL: &str = "https://news.example/rss";

async fn last_update(store: &SubscriptionStore<'_>, feed: i64, destination: i64) -> i64 {
    store
        .list_all_subscribers(feed, StopSignal::never())
        .await
        .unwrap()
        .collect()
        .await
        .into_iter()
        .find(|s| s.destination_id == destination)
        .map(|s| s.last_update.timestamp())
        .expect("subscription should exist")
}

/// Items are delivered oldest first and progress ends at the newest item.
#[tokio::test]
async fn test_delivers_in_publish_order() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    let feed = store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();

    let (t1, t2, t3) = (future(1), future(2), future(3));
    source.set_document(
        FEED_URL,
        document("News", vec![item("third", t3), item("first", t1), item("second", t2)]),
    );

    let updater = FeedUpdater::new(Arc::clone(&db), source.clone(), notifier.clone());
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.feeds, 1);
    assert_eq!(report.failed_feeds, 0);
    assert_eq!(report.delivered, 3);

    let texts = notifier.texts_for(100);
    assert_eq!(texts.len(), 3);
    assert!(texts[0].starts_with("first\nfirst body"));
    assert!(texts[1].starts_with("second\n"));
    assert!(texts[2].starts_with("third\n"));
    assert!(texts[2].ends_with("\n\nLink: https://example.com/third"));

    assert_eq!(last_update(&store, feed.id, 100).await, t3.timestamp());
}

/// A second pass over an unchanged document delivers nothing.
#[tokio::test]
async fn test_rerun_is_idempotent() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();
    source.set_document(
        FEED_URL,
        document("News", vec![item("a", future(1)), item("b", future(2))]),
    );

    let updater = FeedUpdater::new(Arc::clone(&db), source.clone(), notifier.clone());
    updater.run_pass(&StopSignal::never()).await.unwrap();
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(notifier.count(), 2);
    assert_eq!(source.fetches().len(), 2);
}

/// Only items newer than the last delivered one go out on later passes.
#[tokio::test]
async fn test_new_items_on_later_pass() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    let feed = store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();
    source.set_document(FEED_URL, document("News", vec![item("a", future(1))]));

    let updater = FeedUpdater::new(Arc::clone(&db), source.clone(), notifier.clone());
    updater.run_pass(&StopSignal::never()).await.unwrap();

    source.set_document(
        FEED_URL,
        document("News", vec![item("b", future(2)), item("a", future(1))]),
    );
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.delivered, 1);
    assert_eq!(notifier.texts_for(100).len(), 2);
    assert!(notifier.texts_for(100)[1].starts_with("b\n"));
    assert_eq!(last_update(&store, feed.id, 100).await, future(2).timestamp());
}

/// Items published before the subscription are never delivered.
#[tokio::test]
async fn test_old_items_not_delivered() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    SubscriptionStore::new(db.pool())
        .add_subscription(1, 100, FEED_URL, "News")
        .await
        .unwrap();
    let yesterday = chrono::Utc::now() - chrono::TimeDelta::days(1);
    source.set_document(FEED_URL, document("News", vec![item("old", yesterday)]));

    let updater = FeedUpdater::new(Arc::clone(&db), source, notifier.clone());
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(notifier.count(), 0);
}

/// Each subscriber gets its own delta.
#[tokio::test]
async fn test_subscribers_tracked_independently() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    let feed = store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();
    store.add_subscription(2, 200, FEED_URL, "News").await.unwrap();

    // Chat 200 has already seen the first item
    store
        .advance_subscription(200, feed.id, future(1))
        .await
        .unwrap();

    source.set_document(
        FEED_URL,
        document("News", vec![item("a", future(1)), item("b", future(2))]),
    );

    let updater = FeedUpdater::new(Arc::clone(&db), source, notifier.clone());
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.delivered, 3);
    assert_eq!(notifier.texts_for(100).len(), 2);
    assert_eq!(notifier.texts_for(200).len(), 1);
    assert!(notifier.texts_for(200)[0].starts_with("b\n"));
}

/// A failed send stops that subscriber for the pass and is retried later.
#[tokio::test]
async fn test_send_failure_retried_next_pass() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    let feed = store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();
    store.add_subscription(2, 200, FEED_URL, "News").await.unwrap();
    let before = last_update(&store, feed.id, 100).await;

    source.set_document(
        FEED_URL,
        document("News", vec![item("a", future(1)), item("b", future(2))]),
    );
    notifier.fail_for(100);

    let updater = FeedUpdater::new(Arc::clone(&db), source, notifier.clone());
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    // The other subscriber is unaffected
    assert_eq!(report.delivered, 2);
    assert_eq!(notifier.texts_for(200).len(), 2);
    assert_eq!(last_update(&store, feed.id, 100).await, before);

    notifier.recover(100);
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();
    assert_eq!(report.delivered, 2);
    assert_eq!(notifier.texts_for(100).len(), 2);
    assert_eq!(last_update(&store, feed.id, 100).await, future(2).timestamp());
}

/// Feeds with no subscribers are still fetched.
#[tokio::test]
async fn test_orphan_feed_still_polled() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();
    store.remove_subscription(100, 1).await.unwrap();
    source.set_document(FEED_URL, document("News", vec![item("a", future(1))]));

    let updater = FeedUpdater::new(Arc::clone(&db), source.clone(), notifier.clone());
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.feeds, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(source.fetches(), vec![FEED_URL.to_string()]);
}

/// The feed-level update time bounds which subscribers are considered.
#[tokio::test]
async fn test_feed_level_freshness_preferred() {
    let (_dir, db) = setup_test_db().await;
    let source = StaticFeedSource::new();
    let notifier = RecordingNotifier::new();

    let store = SubscriptionStore::new(db.pool());
    let feed = store.add_subscription(1, 100, FEED_URL, "News").await.unwrap();
    store
        .advance_subscription(100, feed.id, future(2))
        .await
        .unwrap();

    // Document claims it last changed before the subscriber's progress
    let mut doc = document("News", vec![item("late", future(3))]);
    doc.updated_at = Some(future(1));
    source.set_document(FEED_URL, doc);

    let updater = FeedUpdater::new(Arc::clone(&db), source, notifier.clone());
    let report = updater.run_pass(&StopSignal::never()).await.unwrap();

    assert_eq!(report.delivered, 0);
    assert_eq!(notifier.count(), 0);
}
