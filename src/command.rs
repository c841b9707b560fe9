//! Chat command handling.
//!
//! Commands map one-to-one onto subscription store operations:
//!
//! - `/help`
//! - `/addfeed <url>` (alias `/subscribe`)
//! - `/feeds` (alias `/list`)
//! - `/removefeed <n>` (alias `/unsubscribe`)

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::BotConfig;
use crate::db::Database;
use crate::feed::{FeedSource, QuotaKind, QuotaLimits, SubscriptionStore};
use crate::rate_limit::{RateLimitConfig, RateLimitResult, RequestLimiter};
use crate::shutdown::StopSignal;
use crate::RelayError;

/// Help text listing the commands.
pub const HELP_TEXT: &str = "This bot can serve you in the following ways:

/addfeed <url> ... Adds an RSS/Atom feed to this chat
/feeds ... Lists the feeds that are assigned to this chat
/removefeed <n> ... Removes a feed from this chat (use the number from /feeds)
";

const BACKEND_ERROR: &str = "Backend error";
const SHUTTING_DOWN: &str = "The bot is shutting down. Try again later.";

/// A command issued in a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Chat the command was issued in.
    pub destination: i64,
    /// User issuing the command.
    pub owner: i64,
    /// Username of the issuing user.
    pub username: String,
    /// Message text, starting with `/`.
    pub text: String,
}

impl CommandRequest {
    /// Create a request.
    pub fn new(destination: i64, owner: i64, username: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            destination,
            owner,
            username: username.into(),
            text: text.into(),
        }
    }

    /// Parse a console line of the form `<chat_id> <user_id> <username> /command args`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.trim().splitn(4, char::is_whitespace);
        let destination = parts.next()?.parse().ok()?;
        let owner = parts.next()?.parse().ok()?;
        let username = parts.next()?;
        let text = parts.next()?.trim();
        if !text.starts_with('/') {
            return None;
        }
        Some(Self::new(destination, owner, username, text))
    }

    /// Split into command name and arguments.
    ///
    /// A `@botname` suffix on the command is ignored.
    pub fn command(&self) -> (&str, &str) {
        let text = self.text.trim();
        let text = text.strip_prefix('/').unwrap_or(text);
        let (name, args) = match text.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (text, ""),
        };
        let name = name.split('@').next().unwrap_or(name);
        (name, args)
    }
}

/// Dispatches chat commands.
pub struct CommandHandler {
    db: Arc<Database>,
    source: Arc<dyn FeedSource>,
    bot: BotConfig,
    throttle: RateLimitConfig,
    stop: StopSignal,
}

impl CommandHandler {
    /// Create a handler.
    pub fn new(
        db: Arc<Database>,
        source: Arc<dyn FeedSource>,
        bot: BotConfig,
        throttle: RateLimitConfig,
    ) -> Self {
        Self {
            db,
            source,
            bot,
            throttle,
            stop: StopSignal::never(),
        }
    }

    /// Abandon listings when `stop` fires.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    fn limits(&self) -> QuotaLimits {
        self.bot.quota_limits()
    }

    /// Handle a command and produce the reply text.
    pub async fn handle(&self, request: &CommandRequest) -> String {
        let (name, args) = request.command();
        info!(
            "User {} ({}) wrote command {} {}",
            request.username, request.owner, name, args
        );

        let limiter = RequestLimiter::new(self.db.pool(), self.throttle);
        match limiter.check_and_record(request.owner, name, args).await {
            Ok(RateLimitResult::Allowed) => {}
            Ok(RateLimitResult::Denied { retry_after }) => {
                warn!("Throttled user {} ({})", request.username, request.owner);
                let minutes = retry_after.as_secs().div_ceil(60).max(1);
                return format!("Too many requests. Try again in {} minute(s).", minutes);
            }
            Err(e) => {
                error!("Failed to check request budget of {}: {}", request.owner, e);
                return BACKEND_ERROR.to_string();
            }
        }

        match name {
            "help" | "start" => HELP_TEXT.to_string(),
            "addfeed" | "subscribe" => self.add_feed(request, args).await,
            "feeds" | "list" => self.list_feeds(request).await,
            "removefeed" | "unsubscribe" => self.remove_feed(request, args).await,
            _ => "I don't know that command. Try /help".to_string(),
        }
    }

    async fn add_feed(&self, request: &CommandRequest, args: &str) -> String {
        if !self.bot.is_whitelisted(&request.username) {
            return "You may not do this.".to_string();
        }

        let url = args.trim();
        if url.is_empty() {
            return "Copy the URL of the feed after the command".to_string();
        }

        let store = SubscriptionStore::new(self.db.pool()).with_limits(self.limits());

        let title = match store.lookup_feed_by_url(url).await {
            Ok(Some(feed)) => feed.title,
            Ok(None) => match self
                .stop
                .guard(self.source.fetch(url, self.stop.deadline()))
                .await
            {
                Ok(document) => document.title.unwrap_or_else(|| url.to_string()),
                Err(e) if e.is_stop() => {
                    info!("Abandoned fetch of {} on shutdown", url);
                    return SHUTTING_DOWN.to_string();
                }
                Err(e) => return format!("Error while fetching feed: {}", e),
            },
            Err(e) => {
                error!("Failed to look up feed {}: {}", url, e);
                return BACKEND_ERROR.to_string();
            }
        };

        match store
            .add_subscription(request.owner, request.destination, url, &title)
            .await
        {
            Ok(feed) => format!("Feed \"{}\" was added to this chat.", feed.title),
            Err(RelayError::QuotaExceeded(kind)) => {
                warn!(
                    "Quota reached for user {} ({}): {}",
                    request.username, request.owner, kind
                );
                match kind {
                    QuotaKind::DestinationLimit => {
                        "You cannot add more feeds to this chat.".to_string()
                    }
                    QuotaKind::OwnerTotalLimit | QuotaKind::OwnerActiveLimit => {
                        "I think you have added enough feeds for now.".to_string()
                    }
                }
            }
            Err(RelayError::Conflict(_)) => "This feed is already in this chat.".to_string(),
            Err(RelayError::Validation(msg)) => msg,
            Err(e) => {
                error!(
                    "Failed to add feed for user {} ({}): {}",
                    request.username, request.owner, e
                );
                BACKEND_ERROR.to_string()
            }
        }
    }

    async fn list_feeds(&self, request: &CommandRequest) -> String {
        let store = SubscriptionStore::new(self.db.pool());
        let mut feeds = match store
            .list_subscriptions(request.destination, self.stop.clone())
            .await
        {
            Ok(cursor) => cursor,
            Err(e) => {
                error!("Failed to enumerate feeds of {}: {}", request.destination, e);
                return BACKEND_ERROR.to_string();
            }
        };

        let mut text = String::from("Feeds in this chat:\n");
        let mut position = 0;
        while let Some(feed) = feeds.next().await {
            position += 1;
            text.push_str(&format!("[{}] {} ({})\n", position, feed.title, feed.url));
        }

        if position == 0 {
            return "No feeds in this chat.".to_string();
        }
        text
    }

    async fn remove_feed(&self, request: &CommandRequest, args: &str) -> String {
        let Ok(ordinal) = args.trim().parse::<i64>() else {
            return "Please provide the number of the feed to remove".to_string();
        };

        let store = SubscriptionStore::new(self.db.pool());
        match store.remove_subscription(request.destination, ordinal).await {
            Ok(Some(feed)) => format!("Feed \"{}\" was removed.", feed.title),
            Ok(None) => format!("No feed with number {}", ordinal),
            Err(e) => {
                error!("Failed to remove feed: {}", e);
                BACKEND_ERROR.to_string()
            }
        }
    }
}
