//! Local channels for inter-node communication.
//!
//! Bounded tokio mpsc channels carry [`StreamItem`]s between nodes; a full
//! channel applies backpressure to async senders.

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::types::{BufferOrEvent, StreamItem};

/// Default channel buffer size (bounded for backpressure).
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Sender side of a local channel.
#[derive(Debug, Clone)]
pub struct LocalChannelSender {
    sender: mpsc::Sender<StreamItem>,
}

impl LocalChannelSender {
    /// Send an item, waiting while the channel is full.
    pub async fn send(&self, item: StreamItem) -> Result<()> {
        self.sender
            .send(item)
            .await
            .map_err(|_| anyhow!("Channel closed: receiver dropped"))
    }

    /// Try to send without waiting.
    ///
    /// Returns `Ok(false)` when the item was dropped because the channel is full.
    pub fn try_send(&self, item: StreamItem) -> Result<bool> {
        match self.sender.try_send(item) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_)) => Ok(false),
            Err(TrySendError::Closed(_)) => Err(anyhow!("Channel closed: receiver dropped")),
        }
    }

    /// Non-owning handle that does not keep the channel open.
    pub fn downgrade(&self) -> WeakChannelSender {
        WeakChannelSender {
            sender: self.sender.downgrade(),
        }
    }

    /// Number of items currently buffered.
    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Weak sender used by a node to feed its own input.
#[derive(Debug, Clone)]
pub struct WeakChannelSender {
    sender: mpsc::WeakSender<StreamItem>,
}

impl WeakChannelSender {
    /// Non-blocking send. Returns false if the item was dropped.
    pub fn try_send(&self, item: StreamItem) -> bool {
        match self.sender.upgrade() {
            Some(sender) => sender.try_send(item).is_ok(),
            None => false,
        }
    }
}

/// Receiver side of a local channel.
#[derive(Debug)]
pub struct LocalChannelReceiver {
    receiver: mpsc::Receiver<StreamItem>,
}

impl LocalChannelReceiver {
    /// Receive the next item; `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<StreamItem> {
        self.receiver.recv().await
    }

    /// Try to receive without waiting.
    pub fn try_recv(&mut self) -> Option<StreamItem> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Create a bounded local channel.
pub fn local_channel(capacity: usize) -> (LocalChannelSender, LocalChannelReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (
        LocalChannelSender { sender },
        LocalChannelReceiver { receiver },
    )
}

/// Create a local channel with the default capacity.
pub fn local_channel_default() -> (LocalChannelSender, LocalChannelReceiver) {
    local_channel(DEFAULT_CHANNEL_CAPACITY)
}

/// Re-injects events released by a barrier aligner ahead of new input.
pub type ReplaySender = mpsc::UnboundedSender<BufferOrEvent>;
pub type ReplayReceiver = mpsc::UnboundedReceiver<BufferOrEvent>;

pub fn replay_channel() -> (ReplaySender, ReplayReceiver) {
    mpsc::unbounded_channel()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StreamEvent, WatermarkTuple};

    fn watermark(ts: i64) -> StreamItem {
        StreamItem::Event(StreamEvent::Watermark(WatermarkTuple::new(ts)))
    }

    #[tokio::test]
    async fn test_send_and_recv() {
        let (tx, mut rx) = local_channel(4);
        tx.send(watermark(1)).await.unwrap();
        tx.send(watermark(2)).await.unwrap();
        assert_eq!(tx.len(), 2);

        assert_eq!(rx.recv().await, Some(watermark(1)));
        assert_eq!(rx.try_recv(), Some(watermark(2)));
        assert_eq!(rx.try_recv(), None);
    }

    #[tokio::test]
    async fn test_try_send_drops_when_full() {
        let (tx, mut rx) = local_channel(1);
        assert!(tx.try_send(watermark(1)).unwrap());
        assert!(!tx.try_send(watermark(2)).unwrap());
        assert_eq!(rx.recv().await, Some(watermark(1)));
    }

    #[tokio::test]
    async fn test_weak_sender_does_not_keep_channel_open() {
        let (tx, mut rx) = local_channel(4);
        let weak = tx.downgrade();
        assert!(weak.try_send(watermark(1)));
        drop(tx);
        assert!(!weak.try_send(watermark(2)));
        assert_eq!(rx.recv().await, Some(watermark(1)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_receiver_errors() {
        let (tx, rx) = local_channel(1);
        drop(rx);
        assert!(tx.send(watermark(1)).await.is_err());
        assert!(tx.try_send(watermark(1)).is_err());
    }
}
