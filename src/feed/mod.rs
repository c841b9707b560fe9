//! Feed subscription module for feedrelay.
//!
//! Feeds, subscriptions, admission quotas and the fetch seam.

pub mod repository;
pub mod source;
pub mod types;

pub use repository::SubscriptionStore;
pub use source::{parse_document, validate_url, FeedSource, HttpFeedSource};
pub use types::{
    normalize_url, Document, DocumentItem, Feed, QuotaKind, QuotaLimits, QuotaUsage, Subscriber,
};
