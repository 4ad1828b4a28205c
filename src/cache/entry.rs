//! Cached values and their freshness horizons.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::Instant;

/// A cached value with its freshness and collection horizons.
///
/// Invariant: `collect_until >= fresh_until >= fetched_at`.
#[derive(Debug)]
pub struct CacheEntry<T> {
    value: Arc<T>,
    fetched_at: Instant,
    fresh_until: Instant,
    collect_until: Instant,
    updated_at: OffsetDateTime,
}

// Manual impl: cloning only bumps the `Arc`, so `T: Clone` is not required.
impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            fetched_at: self.fetched_at,
            fresh_until: self.fresh_until,
            collect_until: self.collect_until,
            updated_at: self.updated_at,
        }
    }
}

/// Freshness of an entry at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
}

impl<T> CacheEntry<T> {
    /// Builds an entry fetched at `now`.
    ///
    /// A `gc_time` shorter than `stale_time` is raised to it so the entry is
    /// never collected while still fresh.
    pub(crate) fn new(value: Arc<T>, now: Instant, stale_time: Duration, gc_time: Duration) -> Self {
        let fresh_until = now + stale_time;
        let collect_until = (now + gc_time).max(fresh_until);
        Self {
            value,
            fetched_at: now,
            fresh_until,
            collect_until,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }

    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    pub fn fetched_at(&self) -> Instant {
        self.fetched_at
    }

    pub fn fresh_until(&self) -> Instant {
        self.fresh_until
    }

    pub fn collect_until(&self) -> Instant {
        self.collect_until
    }

    /// Wall-clock time of the last successful fetch.
    pub fn updated_at(&self) -> OffsetDateTime {
        self.updated_at
    }

    pub fn is_fresh_at(&self, now: Instant) -> bool {
        now < self.fresh_until
    }

    pub fn is_stale_at(&self, now: Instant) -> bool {
        !self.is_fresh_at(now)
    }

    pub fn freshness_at(&self, now: Instant) -> Freshness {
        if self.is_fresh_at(now) {
            Freshness::Fresh
        } else {
            Freshness::Stale
        }
    }

    pub fn is_collectable_at(&self, now: Instant) -> bool {
        self.collect_until <= now
    }

    /// Ends the freshness window at `now` without touching the value.
    pub(crate) fn mark_stale(&mut self, now: Instant) {
        let now = now.max(self.fetched_at);
        if now < self.fresh_until {
            self.fresh_until = now;
        }
    }
}
