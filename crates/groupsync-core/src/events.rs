//! Group event notifications
//!
//! Every group context owns one [`EventEmitter`]. The metadata index emits a
//! notification for each entry it applies, the message path for each message
//! it decrypts.
//!
//! ## Back-pressure
//!
//! The emitter is a bounded broadcast channel. Emitting never blocks the
//! writer; a subscriber that falls behind loses the oldest notifications and
//! [`EventSubscription::lagged`] counts how many it missed. Dropping the
//! subscription (or calling [`EventSubscription::unsubscribe`]) detaches it.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

use crate::identity::PubKey;
use crate::log::EntryHash;
use crate::message::GroupMessageEvent;
use crate::metadata::GroupMetadataEvent;

/// A metadata log entry that was applied to the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataNotification {
    pub entry: EntryHash,
    /// Device that authored the entry
    pub sender: PubKey,
    pub event: GroupMetadataEvent,
}

/// Notification delivered to subscribers of a group context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Metadata(MetadataNotification),
    Message(GroupMessageEvent),
}

/// Broadcast side of a group's event stream.
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<GroupEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to future notifications.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            lagged: 0,
        }
    }

    /// Send to every current subscriber; returns how many received it.
    pub fn emit(&self, event: GroupEvent) -> usize {
        // No subscribers is not an error
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiving side of a group's event stream.
pub struct EventSubscription {
    rx: broadcast::Receiver<GroupEvent>,
    lagged: u64,
}

impl EventSubscription {
    /// Next notification, or `None` once the emitter is gone.
    pub async fn recv(&mut self) -> Option<GroupEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => {
                    debug!(missed = n, "Event subscriber lagged");
                    self.lagged += n;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next notification if one is ready.
    pub fn try_recv(&mut self) -> Option<GroupEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.lagged += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Notifications dropped because this subscriber fell behind.
    pub fn lagged(&self) -> u64 {
        self.lagged
    }

    pub fn unsubscribe(self) {}
}
