//! Outbound stanza handle.
//!
//! Handlers never perform network I/O. Replies and notifications are queued
//! on a bounded channel drained by whatever transport owns the service.
//! Replies to requests wait for channel capacity; notifications are dropped
//! when the channel is full.

use minidom::Element;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Result of queueing an outbound stanza.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Stanza was queued for delivery
    Sent,
    /// The channel is full (backpressure)
    ChannelFull,
    /// The receiving side has gone away
    ChannelClosed,
}

/// Handle used to send stanzas back out of the pub/sub engine.
#[derive(Debug, Clone)]
pub struct StanzaSender {
    tx: mpsc::Sender<Element>,
}

impl StanzaSender {
    pub fn new(tx: mpsc::Sender<Element>) -> Self {
        Self { tx }
    }

    /// Create a sender with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Element>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Queue a stanza without waiting.
    pub fn send(&self, stanza: Element) -> SendResult {
        let to = stanza.attr("to").unwrap_or_default().to_string();
        match self.tx.try_send(stanza) {
            Ok(()) => {
                debug!(to = %to, "Stanza queued for delivery");
                SendResult::Sent
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(to = %to, "Outbound channel full, dropping stanza");
                SendResult::ChannelFull
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(to = %to, "Outbound channel closed");
                SendResult::ChannelClosed
            }
        }
    }

    /// Queue a reply, waiting while the channel is full.
    pub async fn reply(&self, stanza: Element) -> SendResult {
        let to = stanza.attr("to").unwrap_or_default().to_string();
        match self.tx.send(stanza).await {
            Ok(()) => {
                debug!(to = %to, "Reply queued for delivery");
                SendResult::Sent
            }
            Err(_) => {
                debug!(to = %to, "Outbound channel closed");
                SendResult::ChannelClosed
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
