//! Periodic collection of expired entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use super::store::CacheStore;

/// Handle to the background collector; the task stops when the handle is
/// dropped or shut down.
pub struct CollectorHandle {
    task: JoinHandle<()>,
}

impl CollectorHandle {
    pub fn shutdown(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CollectorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Run [`CacheStore::evict_expired`] every `period`.
pub fn spawn_collector<T>(store: Arc<CacheStore<T>>, period: Duration) -> CollectorHandle
where
    T: Send + Sync + 'static,
{
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let evicted = store.evict_expired(Instant::now());
            if evicted > 0 {
                debug!(evicted, remaining = store.len(), "Collector pass finished");
            }
        }
    });
    CollectorHandle { task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key;

    #[tokio::test(start_paused = true)]
    async fn collects_expired_entries_periodically() {
        let store = Arc::new(CacheStore::<u8>::default());
        store.set(cache_key!["short"], 1, Duration::ZERO, Duration::from_secs(2));
        store.set(cache_key!["long"], 2, Duration::ZERO, Duration::from_secs(60));

        let handle = spawn_collector(Arc::clone(&store), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(3_500)).await;

        assert_eq!(store.keys(), vec![cache_key!["long"]]);
        assert!(!handle.is_finished());
        handle.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_stops_collection() {
        let store = Arc::new(CacheStore::<u8>::default());
        let handle = spawn_collector(Arc::clone(&store), Duration::from_secs(1));
        drop(handle);

        store.set(cache_key!["short"], 1, Duration::ZERO, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Nobody collected it; the entry is still in the map until read.
        assert_eq!(store.len(), 1);
    }
}
