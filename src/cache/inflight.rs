//! In-flight fetch registry.
//!
//! Holds at most one pending request per key. Callers asking for a key that is
//! already being fetched attach as waiters instead of starting a second fetch,
//! and every waiter receives the same outcome in registration order.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use super::error::CacheError;
use super::keys::CacheKey;
use super::store::CacheStore;

pub(crate) type FetchOutcome<T> = Result<Arc<T>, CacheError>;

/// Handed to the caller that must run the fetch for a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FetchTicket {
    pub(crate) generation: u64,
    /// Store revision the fetch started from.
    pub(crate) revision: u64,
}

struct PendingRequest<T> {
    generation: u64,
    /// Store revision when the fetch started.
    revision: u64,
    /// Started for a stale-while-refetching answer; never cancelled as orphaned.
    background: bool,
    waiters: Vec<(u64, oneshot::Sender<FetchOutcome<T>>)>,
    task: Option<AbortHandle>,
}

impl<T> PendingRequest<T> {
    fn new(ticket: FetchTicket, background: bool) -> Self {
        Self {
            generation: ticket.generation,
            revision: ticket.revision,
            background,
            waiters: Vec::new(),
            task: None,
        }
    }
}

pub(crate) struct InFlight<T> {
    requests: DashMap<CacheKey, PendingRequest<T>>,
    next_id: AtomicU64,
    cancel_orphaned: bool,
}

impl<T> InFlight<T> {
    pub(crate) fn new(cancel_orphaned: bool) -> Self {
        Self {
            requests: DashMap::new(),
            next_id: AtomicU64::new(1),
            cancel_orphaned,
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a waiter for `key`, registering a new pending request when none
    /// exists or when the running one was invalidated after it started. The
    /// generation is returned only to the caller that must start the fetch.
    pub(crate) fn join(
        self: &Arc<Self>,
        key: &CacheKey,
        store: &CacheStore<T>,
    ) -> (Waiter<T>, Option<FetchTicket>) {
        let waiter_id = self.next_id();
        let (sender, receiver) = oneshot::channel();
        let mut superseded = None;

        let ticket = match self.requests.entry(key.clone()) {
            Entry::Occupied(mut occupied)
                if !store.invalidated_since(key, occupied.get().revision) =>
            {
                occupied.get_mut().waiters.push((waiter_id, sender));
                debug!(key = %key, waiters = occupied.get().waiters.len(), "Joined in-flight fetch");
                None
            }
            Entry::Occupied(mut occupied) => {
                let ticket = self.ticket(store);
                let background = occupied.get().background;
                let pending = occupied.get_mut();
                superseded = supersede(key, pending, ticket, background);
                pending.waiters.push((waiter_id, sender));
                Some(ticket)
            }
            Entry::Vacant(vacant) => {
                let ticket = self.ticket(store);
                let mut pending = PendingRequest::new(ticket, false);
                pending.waiters.push((waiter_id, sender));
                vacant.insert(pending);
                Some(ticket)
            }
        };
        if let Some(task) = superseded {
            task.abort();
        }

        let waiter = Waiter {
            key: key.clone(),
            id: waiter_id,
            receiver: Some(receiver),
            inflight: Arc::clone(self),
        };
        (waiter, ticket)
    }

    /// Register a background request with no waiters. Returns `None` when a
    /// fetch for `key` started after the last invalidation is already running;
    /// that fetch is then kept alive as the background refresh.
    pub(crate) fn start_detached(
        &self,
        key: &CacheKey,
        store: &CacheStore<T>,
    ) -> Option<FetchTicket> {
        let mut superseded = None;
        let ticket = match self.requests.entry(key.clone()) {
            Entry::Occupied(mut occupied)
                if !store.invalidated_since(key, occupied.get().revision) =>
            {
                occupied.get_mut().background = true;
                None
            }
            Entry::Occupied(mut occupied) => {
                let ticket = self.ticket(store);
                superseded = supersede(key, occupied.get_mut(), ticket, true);
                Some(ticket)
            }
            Entry::Vacant(vacant) => {
                let ticket = self.ticket(store);
                vacant.insert(PendingRequest::new(ticket, true));
                Some(ticket)
            }
        };
        if let Some(task) = superseded {
            task.abort();
        }
        ticket
    }

    fn ticket(&self, store: &CacheStore<T>) -> FetchTicket {
        FetchTicket {
            generation: self.next_id(),
            revision: store.revision(),
        }
    }

    /// Whether `generation` is still the registered request for `key`.
    pub(crate) fn is_current(&self, key: &CacheKey, generation: u64) -> bool {
        self.requests
            .get(key)
            .is_some_and(|pending| pending.generation == generation)
    }

    pub(crate) fn attach_task(&self, key: &CacheKey, generation: u64, task: AbortHandle) {
        if let Some(mut pending) = self.requests.get_mut(key) {
            if pending.generation == generation {
                pending.task = Some(task);
            }
        }
    }

    /// Resolve every waiter of the request, oldest first. Returns how many
    /// waiters were still attached.
    pub(crate) fn complete(&self, key: &CacheKey, generation: u64, outcome: FetchOutcome<T>) -> usize {
        let Some((_, pending)) = self
            .requests
            .remove_if(key, |_, pending| pending.generation == generation)
        else {
            return 0;
        };

        let count = pending.waiters.len();
        for (_, sender) in pending.waiters {
            let _ = sender.send(outcome.clone());
        }
        count
    }

    /// Drop the request without an outcome; attached waiters observe
    /// [`CacheError::Cancelled`].
    pub(crate) fn abandon(&self, key: &CacheKey, generation: u64) {
        if self
            .requests
            .remove_if(key, |_, pending| pending.generation == generation)
            .is_some()
        {
            debug!(key = %key, "Abandoned in-flight fetch");
        }
    }

    pub(crate) fn contains(&self, key: &CacheKey) -> bool {
        self.requests.contains_key(key)
    }

    pub(crate) fn waiter_count(&self, key: &CacheKey) -> usize {
        self.requests
            .get(key)
            .map(|pending| pending.waiters.len())
            .unwrap_or(0)
    }

    fn detach(&self, key: &CacheKey, waiter_id: u64) {
        let orphaned = {
            let Some(mut pending) = self.requests.get_mut(key) else {
                return;
            };
            let before = pending.waiters.len();
            pending.waiters.retain(|(id, _)| *id != waiter_id);
            before != pending.waiters.len() && pending.waiters.is_empty() && !pending.background
        };

        if !orphaned || !self.cancel_orphaned {
            return;
        }

        if let Some((_, pending)) = self
            .requests
            .remove_if(key, |_, pending| pending.waiters.is_empty() && !pending.background)
        {
            if let Some(task) = pending.task {
                task.abort();
            }
            debug!(key = %key, "Cancelled fetch after its last waiter detached");
        }
    }
}

/// Replace a request invalidated after it started with a fresh one. Its
/// waiters move over in order; the returned task must be aborted once the map
/// entry is released so the old value never lands in the cache.
fn supersede<T>(
    key: &CacheKey,
    pending: &mut PendingRequest<T>,
    ticket: FetchTicket,
    background: bool,
) -> Option<AbortHandle> {
    let previous = std::mem::replace(pending, PendingRequest::new(ticket, background));
    pending.waiters = previous.waiters;
    debug!(
        key = %key,
        waiters = pending.waiters.len(),
        "Superseded in-flight fetch after invalidation"
    );
    previous.task
}

/// A caller waiting on a shared fetch.
///
/// Dropping it before the outcome arrives detaches the caller; the fetch keeps
/// running for any remaining waiters.
pub(crate) struct Waiter<T> {
    key: CacheKey,
    id: u64,
    receiver: Option<oneshot::Receiver<FetchOutcome<T>>>,
    inflight: Arc<InFlight<T>>,
}

impl<T> Waiter<T> {
    pub(crate) async fn wait(mut self) -> FetchOutcome<T> {
        let Some(receiver) = self.receiver.as_mut() else {
            return Err(CacheError::Cancelled);
        };
        let outcome = receiver.await.unwrap_or(Err(CacheError::Cancelled));
        self.receiver = None;
        outcome
    }
}

impl<T> Drop for Waiter<T> {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.inflight.detach(&self.key, self.id);
        }
    }
}
