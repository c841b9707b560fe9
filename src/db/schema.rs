//! Database schema and migrations for feedrelay.
//!
//! Migrations are applied sequentially when the database is first opened
//! or upgraded.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
/// Timestamps are UNIX seconds.
pub const MIGRATIONS: &[&str] = &[
    // v1: Feeds and subscriptions
    r#"
-- Feeds, identified by the scheme-less URL key
CREATE TABLE feeds (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    url         TEXT NOT NULL,
    url_key     TEXT NOT NULL UNIQUE,
    title       TEXT NOT NULL DEFAULT '',
    created_by  INTEGER NOT NULL,
    created_at  INTEGER NOT NULL
);

CREATE INDEX idx_feeds_created_by ON feeds(created_by);

-- Subscriptions; id is the insertion sequence used for ordinal addressing
CREATE TABLE subscriptions (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    destination_id  INTEGER NOT NULL,
    feed_id         INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    owner_id        INTEGER NOT NULL,
    last_update     INTEGER NOT NULL,
    UNIQUE(destination_id, feed_id)
);

CREATE INDEX idx_subscriptions_feed ON subscriptions(feed_id, last_update);
CREATE INDEX idx_subscriptions_owner ON subscriptions(owner_id);
"#,
    // v2: Fetch failure log for quarantine
    r#"
CREATE TABLE feed_errors (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_id      INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
    occurred_at  INTEGER NOT NULL,
    message      TEXT NOT NULL DEFAULT ''
);

CREATE INDEX idx_feed_errors_feed ON feed_errors(feed_id, occurred_at);
"#,
    // v3: Request log for throttling
    r#"
CREATE TABLE requests (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id    INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    name        TEXT NOT NULL,
    text        TEXT NOT NULL DEFAULT ''
);

CREATE INDEX idx_requests_owner ON requests(owner_id, created_at);
"#,
];
