//! feedrelay - Feed relay bot
//!
//! Polls RSS/Atom feeds and delivers new items to the chats subscribed to
//! them, exactly once per chat and in publish order.

pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod feed;
pub mod logging;
pub mod notify;
pub mod rate_limit;
pub mod shutdown;
pub mod update;

pub use command::{CommandHandler, CommandRequest};
pub use config::Config;
pub use db::{Cursor, Database};
pub use error::{RelayError, Result};
pub use feed::{
    Document, DocumentItem, Feed, FeedSource, HttpFeedSource, QuotaKind, QuotaLimits, Subscriber,
    SubscriptionStore,
};
pub use notify::{ChannelNotifier, Notifier, OutboundMessage};
pub use shutdown::{Shutdown, StopSignal};
pub use update::{
    start_updater, FeedUpdater, PassReport, Quarantine, QuarantineOutcome, QuarantinePolicy,
};
