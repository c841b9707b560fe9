//! Feed fetching.
//!
//! [`FeedSource`] is the seam between the update engine and the network.
//! [`HttpFeedSource`] fetches over HTTP with SSRF checks and size limits and
//! parses RSS/Atom/JSON feeds with `feed-rs`.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use feed_rs::parser;
use reqwest::Client;
use tokio::time::Instant;
use tracing::debug;

use super::types::{Document, DocumentItem};
use crate::config::FetchConfig;
use crate::{RelayError, Result};

/// User agent string for feed fetching.
const USER_AGENT: &str = "feedrelay/0.1 (+feed relay bot)";

/// Descriptions longer than this (in characters) are cut.
const MAX_DESCRIPTION_CHARS: usize = 1000;

/// Something that turns a feed URL into a parsed document.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch and parse the feed at `url`, giving up at `deadline`.
    async fn fetch(&self, url: &str, deadline: Option<Instant>) -> Result<Document>;
}

/// HTTP feed source.
pub struct HttpFeedSource {
    client: Client,
    max_size: u64,
    allow_private_hosts: bool,
}

impl HttpFeedSource {
    /// Create a source from fetch configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .timeout(Duration::from_secs(config.total_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| RelayError::Fetch(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_size: config.max_feed_size_bytes,
            allow_private_hosts: config.allow_private_hosts,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| RelayError::Fetch(format!("failed to fetch feed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Fetch(format!("HTTP error: {}", status)));
        }

        if let Some(length) = response.content_length() {
            if length > self.max_size {
                return Err(too_large(length, self.max_size));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| RelayError::Fetch(format!("failed to read response: {}", e)))?;

        if bytes.len() as u64 > self.max_size {
            return Err(too_large(bytes.len() as u64, self.max_size));
        }

        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str, deadline: Option<Instant>) -> Result<Document> {
        if !self.allow_private_hosts {
            validate_url(url)?;
        }

        debug!("Fetching feed {}", url);
        let bytes = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, self.download(url))
                .await
                .map_err(|_| RelayError::Fetch(format!("timed out fetching {}", url)))??,
            None => self.download(url).await?,
        };

        parse_document(&bytes)
    }
}

fn too_large(size: u64, max: u64) -> RelayError {
    RelayError::Fetch(format!("feed too large: {} bytes (max {} bytes)", size, max))
}

/// Check that `url` is an http(s) URL pointing at a public host.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed = url::Url::parse(url)
        .map_err(|e| RelayError::Validation(format!("invalid URL: {}", e)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(RelayError::Validation(format!(
            "unsupported URL scheme: {}",
            parsed.scheme()
        )));
    }

    let host = parsed
        .host()
        .ok_or_else(|| RelayError::Validation("URL has no host".to_string()))?;

    let private = match host {
        url::Host::Domain(domain) => {
            if is_forbidden_hostname(domain) {
                return Err(RelayError::Validation(format!("forbidden host: {}", domain)));
            }
            None
        }
        url::Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
        url::Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
    };

    match private {
        Some(ip) if is_private_ip(&ip) => Err(RelayError::Validation(format!(
            "private IP address not allowed: {}",
            ip
        ))),
        _ => Ok(()),
    }
}

/// Hostnames that only resolve inside a private network.
fn is_forbidden_hostname(host: &str) -> bool {
    const SUFFIXES: &[&str] = &[
        ".local",
        ".localhost",
        ".internal",
        ".intranet",
        ".corp",
        ".home",
        ".lan",
    ];

    let host = host.to_ascii_lowercase();
    host == "localhost" || SUFFIXES.iter().any(|suffix| host.ends_with(suffix))
}

/// Loopback, private, link-local and otherwise non-routable addresses.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || matches!((a, b, c), (192, 0, 2) | (198, 51, 100) | (203, 0, 113))
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00
                || (first & 0xffc0) == 0xfe80
        }
    }
}

/// Parse raw feed bytes into a [`Document`].
pub fn parse_document(bytes: &[u8]) -> Result<Document> {
    let feed =
        parser::parse(bytes).map_err(|e| RelayError::Fetch(format!("failed to parse feed: {}", e)))?;

    let items = feed
        .entries
        .into_iter()
        .map(|entry| DocumentItem {
            title: entry
                .title
                .map(|t| strip_html(&t.content))
                .unwrap_or_default(),
            description: entry
                .summary
                .map(|t| t.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .map(|d| truncate_chars(&strip_html(&d), MAX_DESCRIPTION_CHARS)),
            link: entry.links.first().map(|l| l.href.clone()),
            published_at: entry.published.or(entry.updated),
        })
        .collect();

    Ok(Document {
        title: feed.title.map(|t| strip_html(&t.content)),
        updated_at: feed.updated.or(feed.published),
        items,
    })
}

/// Remove markup and collapse whitespace.
pub(crate) fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;

    while let Some(ch) = rest.chars().next() {
        match ch {
            '<' => {
                rest = match rest.find('>') {
                    Some(end) => &rest[end + 1..],
                    None => "",
                };
                text.push(' ');
                continue;
            }
            '&' => {
                if let Some((decoded, len)) = decode_entity(rest) {
                    text.push(decoded);
                    rest = &rest[len..];
                    continue;
                }
                text.push('&');
            }
            _ => text.push(ch),
        }
        rest = &rest[ch.len_utf8()..];
    }

    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode the entity at the start of `s`, returning the character and the
/// number of bytes consumed.
fn decode_entity(s: &str) -> Option<(char, usize)> {
    let end = s.get(..12).unwrap_or(s).find(';')?;
    let name = &s[1..end];

    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => {
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()?
            } else {
                name.strip_prefix('#')?.parse().ok()?
            };
            char::from_u32(code)?
        }
    };

    Some((ch, end + 1))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
