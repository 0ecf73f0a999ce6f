//! Fan-out of updates to every connected subscriber except the sender.
//!
//! Each subscriber owns an unbounded outbound channel of pre-encoded frames.
//! An update is encoded once and the same `Arc` bytes are handed to every
//! target, so a broadcast never waits on a slow connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

use covis_core::model::{SubscriberId, Update};

use crate::protocol::{encode_update, ProtocolError};

/// Pre-encoded frame shared between all recipients.
pub type Frame = Arc<Vec<u8>>;

/// Outbound half of a subscriber's delivery channel.
pub type FrameSender = mpsc::UnboundedSender<Frame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_subscribers: usize,
}

/// Atomic broadcast stats, updated without taking the registry lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// Registry of connected subscribers and their outbound channels.
///
/// The lock is a plain `std` lock: it is only held for map access and
/// non-blocking channel sends, never across an await point.
pub struct SubscriberRegistry {
    subscribers: RwLock<HashMap<SubscriberId, FrameSender>>,
    atomic_stats: AtomicBroadcastStats,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            atomic_stats: AtomicBroadcastStats::new(),
        }
    }

    /// Add a subscriber. A previous channel under the same id is replaced.
    pub fn register(&self, id: impl Into<SubscriberId>, sender: FrameSender) {
        let id = id.into();
        log::debug!("Registering subscriber {id}");
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        subscribers.insert(id, sender);
    }

    /// Remove a subscriber. Safe to call more than once.
    ///
    /// Dropping the stored sender completes the subscriber's outbound stream
    /// once the session itself lets go of its receiver.
    pub fn unregister(&self, id: &str) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let removed = subscribers.remove(id).is_some();
        if removed {
            log::debug!("Unregistered subscriber {id}");
        }
        removed
    }

    /// Deliver `update` to every registered subscriber other than `sender`.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn broadcast_except(&self, sender: &str, update: &Update) -> Result<usize, ProtocolError> {
        let frame = Arc::new(encode_update(update)?);
        Ok(self.broadcast_frame_except(sender, frame))
    }

    /// Fan out an already encoded frame.
    pub fn broadcast_frame_except(&self, sender: &str, frame: Frame) -> usize {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut delivered = 0;
        for (id, tx) in subscribers.iter() {
            if id == sender {
                continue;
            }
            if tx.send(frame.clone()).is_ok() {
                delivered += 1;
                log::trace!("Queued frame for {id}");
            } else {
                self.atomic_stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Subscriber {id} channel closed, frame dropped");
            }
        }
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_subscribers: self.subscriber_count(),
        }
    }
}
