//! Outbound message delivery.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{RelayError, Result};

/// A message addressed to a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Destination (chat) ID.
    pub destination: i64,
    /// Message text.
    pub text: String,
}

/// Delivers text to a destination. Delivery may fail.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send `text` to `destination`.
    async fn send(&self, destination: i64, text: &str) -> Result<()>;
}

/// Notifier that hands messages to a transport task over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<OutboundMessage>,
}

impl ChannelNotifier {
    /// Create a notifier and the receiving end the transport drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn send(&self, destination: i64, text: &str) -> Result<()> {
        self.tx
            .send(OutboundMessage {
                destination,
                text: text.to_string(),
            })
            .await
            .map_err(|_| RelayError::Notify("outbound channel closed".to_string()))
    }
}
