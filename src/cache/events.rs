//! Cache event bus.
//!
//! Every state change of a cached key is published as a [`CacheEvent`] so
//! observers can react to refreshes, invalidations and evictions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::keys::CacheKey;

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

/// A state change of one cache key.
#[derive(Debug, Clone, Serialize)]
pub struct CacheEvent {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    /// Monotonic epoch; later events carry larger epochs.
    pub epoch: Epoch,
    pub key: CacheKey,
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(key: CacheKey, kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            key,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A fetch succeeded and replaced the cached value.
    Updated,
    /// The entry was marked stale.
    Invalidated,
    /// The entry passed its collection horizon and was dropped.
    Evicted,
    /// The entry was removed explicitly.
    Removed,
    /// A fetch failed after exhausting its retries.
    FetchFailed,
}

/// Broadcast bus for cache events.
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
    epoch_counter: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            epoch_counter: AtomicU64::new(0),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event; succeeds even when nobody is subscribed.
    pub fn publish(&self, key: &CacheKey, kind: EventKind) -> Epoch {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(key.clone(), kind, epoch);

        debug!(
            event_id = %event.id,
            event_epoch = epoch,
            event_kind = ?kind,
            key = %key,
            "Cache event published"
        );

        let _ = self.sender.send(event);
        epoch
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
