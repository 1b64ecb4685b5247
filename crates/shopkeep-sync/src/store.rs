//! The query cache.
//!
//! One slot per [`QueryKey`] holds the entry the UI renders, the loader used
//! to refresh it, and at most one in-flight fetch. Every change to an entry
//! goes through this type so subscribers are notified through the bus and
//! staleness bookkeeping stays consistent.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bus::{BusSubscription, CacheEvent, InvalidationBus};
use crate::entry::{CacheEntry, EntrySnapshot, EntryStatus};
use crate::{FetchOutcome, QueryKey, SyncError};

/// What a loader produces: a value (real or fallback), or an error when no
/// substitute exists.
pub type LoadResult<V> = Result<FetchOutcome<V>, SyncError>;

/// Re-runnable fetch for one key.
pub type Loader<V> = Arc<dyn Fn() -> BoxFuture<'static, LoadResult<V>> + Send + Sync>;

type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, SyncError>>>;

/// Wrap an async closure as a [`Loader`].
pub fn loader<V, F, Fut>(f: F) -> Loader<V>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = LoadResult<V>> + Send + 'static,
{
    Arc::new(move || f().boxed())
}

struct Slot<V> {
    entry: CacheEntry<V>,
    loader: Option<Loader<V>>,
    /// Sequence number and handle of the fetch currently running.
    in_flight: Option<(u64, SharedFetch<V>)>,
    /// An invalidation arrived while a fetch was running.
    refetch_queued: bool,
    /// Sequence number of the last optimistic patch still in effect.
    optimistic_seq: Option<u64>,
    /// A fetch result was thrown away in favor of the live patch.
    discarded_fetch: bool,
    /// When the last subscriber left (or the slot was created unobserved).
    idle_since: Option<Instant>,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Self {
            entry: CacheEntry::idle(),
            loader: None,
            in_flight: None,
            refetch_queued: false,
            optimistic_seq: None,
            discarded_fetch: false,
            idle_since: Some(Instant::now()),
        }
    }

    fn snapshot(&self) -> EntrySnapshot<V>
    where
        V: Clone,
    {
        EntrySnapshot {
            data: self.entry.data.clone(),
            status: self.entry.status,
            last_fetched_at: self.entry.last_fetched_at,
            error: self.entry.error.clone(),
        }
    }
}

enum Begin<V> {
    Ready(V),
    Pending(SharedFetch<V>),
    NoLoader,
}

/// Session-wide cache of query results.
pub struct CacheStore<V> {
    slots: DashMap<QueryKey, Slot<V>>,
    bus: Arc<InvalidationBus>,
    retention: Option<Duration>,
    /// Orders fetch starts against optimistic patches.
    seq: AtomicU64,
    this: Weak<Self>,
}

impl<V> CacheStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Create a store delivering notifications through `bus`.
    pub fn new(bus: Arc<InvalidationBus>, retention: Option<Duration>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            slots: DashMap::new(),
            bus,
            retention,
            seq: AtomicU64::new(0),
            this: this.clone(),
        })
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.bus
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn slot_mut(&self, key: &QueryKey) -> RefMut<'_, QueryKey, Slot<V>> {
        self.slots.entry(key.clone()).or_insert_with(Slot::new)
    }

    fn notify_updated(&self, key: &QueryKey) {
        self.bus
            .publish([CacheEvent::KeyUpdated { key: key.clone() }]);
    }

    /// Current entry for `key`, if one exists. Never suspends.
    pub fn get(&self, key: &QueryKey) -> Option<CacheEntry<V>> {
        self.slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Current data for `key`, if any.
    pub fn data(&self, key: &QueryKey) -> Option<V> {
        self.slots.get(key).and_then(|slot| slot.entry.data.clone())
    }

    /// Keys with an entry, in no particular order.
    pub fn keys(&self) -> Vec<QueryKey> {
        self.slots.iter().map(|r| r.key().clone()).collect()
    }

    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.bus.subscriber_count(key)
    }

    /// Set the loader used by invalidation, polling and first subscription.
    pub fn register_loader(&self, key: &QueryKey, loader: Loader<V>) {
        self.slot_mut(key).loader = Some(loader);
    }

    /// Resolve `key`: cached fresh data, the fetch already in flight, or a
    /// new fetch through `loader` (which becomes the key's registered loader).
    ///
    /// Only fails when the fetch failed without a fallback and the key has
    /// never held data.
    pub async fn ensure(&self, key: &QueryKey, loader: Loader<V>) -> Result<V, SyncError> {
        self.register_loader(key, loader);
        match self.begin(key, false) {
            Begin::Ready(value) => Ok(value),
            Begin::Pending(fetch) => fetch.await,
            Begin::NoLoader => Err(SyncError::NoLoader(key.clone())),
        }
    }

    /// Start a background fetch with the registered loader, or attach to the
    /// one in flight. Returns false when no loader is registered.
    pub fn refetch(&self, key: &QueryKey) -> bool {
        !matches!(self.begin(key, true), Begin::NoLoader)
    }

    fn begin(&self, key: &QueryKey, force: bool) -> Begin<V> {
        let fetch = {
            let mut slot = self.slot_mut(key);

            if !force
                && slot.entry.is_fresh()
                && let Some(data) = &slot.entry.data
            {
                return Begin::Ready(data.clone());
            }

            if let Some((_, fetch)) = &slot.in_flight {
                trace!(key = %key, "cache: attaching to in-flight fetch");
                return Begin::Pending(fetch.clone());
            }

            let Some(loader) = slot.loader.clone() else {
                return Begin::NoLoader;
            };

            let seq = self.next_seq();
            let fetch = run_fetch(self.this.clone(), key.clone(), seq, Instant::now(), loader)
                .boxed()
                .shared();

            slot.in_flight = Some((seq, fetch.clone()));
            slot.refetch_queued = false;
            slot.entry.in_flight = true;
            slot.entry.status = EntryStatus::Loading;
            debug!(key = %key, seq, "cache: fetch started");
            fetch
        };

        // Drive the fetch even if every caller stops awaiting it. Without a
        // runtime it only makes progress while someone awaits it.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(fetch.clone());
            }
            Err(_) => trace!(key = %key, "cache: no runtime, fetch runs when awaited"),
        }
        self.notify_updated(key);
        Begin::Pending(fetch)
    }

    fn settle(
        &self,
        key: &QueryKey,
        seq: u64,
        started_at: Instant,
        result: LoadResult<V>,
    ) -> Result<V, SyncError> {
        let (resolved, follow_up) = {
            let Some(mut slot) = self.slots.get_mut(key) else {
                debug!(key = %key, seq, "cache: entry evicted before fetch settled");
                return result.map(FetchOutcome::into_value);
            };

            if slot.in_flight.as_ref().is_some_and(|(s, _)| *s == seq) {
                slot.in_flight = None;
                slot.entry.in_flight = false;
            }

            // A fetch issued before the current optimistic patch must not
            // overwrite it; a later fetch will.
            let superseded = slot.optimistic_seq.is_some_and(|patch| seq < patch);

            let resolved = match result {
                Ok(FetchOutcome::Fresh(value)) if superseded => {
                    debug!(key = %key, seq, "cache: keeping optimistic data over older fetch");
                    slot.entry.status = EntryStatus::Stale;
                    slot.discarded_fetch = true;
                    Ok(slot.entry.data.clone().unwrap_or(value))
                }
                Ok(FetchOutcome::Fresh(value)) => {
                    slot.entry.data = Some(value.clone());
                    slot.entry.status = EntryStatus::Fresh;
                    slot.entry.last_fetched_at = Some(started_at);
                    slot.entry.error = None;
                    slot.optimistic_seq = None;
                    slot.discarded_fetch = false;
                    debug!(key = %key, seq, "cache: fetch succeeded");
                    Ok(value)
                }
                Ok(FetchOutcome::Fallback { value, cause }) => {
                    warn!(key = %key, kind = cause.kind(), error = %cause, "cache: serving fallback data");
                    if slot.entry.data.is_none() {
                        slot.entry.data = Some(value.clone());
                    }
                    slot.entry.status = EntryStatus::Error;
                    slot.entry.error = Some(cause.into());
                    Ok(value)
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "cache: fetch failed");
                    slot.entry.status = EntryStatus::Error;
                    slot.entry.error = Some(err.clone());
                    match &slot.entry.data {
                        Some(previous) => Ok(previous.clone()),
                        None => Err(SyncError::Unavailable {
                            key: key.clone(),
                            reason: err.to_string(),
                        }),
                    }
                }
            };

            // The result predates an invalidation. Without a subscriber to run
            // the queued refetch the next reader has to fetch.
            let follow_up = std::mem::take(&mut slot.refetch_queued);
            if follow_up && slot.entry.status == EntryStatus::Fresh {
                slot.entry.status = EntryStatus::Stale;
            }
            (resolved, follow_up)
        };

        self.notify_updated(key);

        if follow_up && self.subscriber_count(key) > 0 {
            debug!(key = %key, "cache: running refetch queued during fetch");
            self.begin(key, true);
        }

        resolved
    }

    /// Mark keys stale, keeping their data. Subscribed keys are refetched
    /// right away; a key with a fetch in flight gets one follow-up fetch
    /// after it settles.
    pub fn invalidate(&self, keys: &[QueryKey]) {
        let mut events = Vec::with_capacity(keys.len());
        let mut to_fetch = Vec::new();

        for key in keys {
            let in_flight = {
                let Some(mut slot) = self.slots.get_mut(key) else {
                    continue;
                };
                if slot.in_flight.is_some() {
                    slot.refetch_queued = true;
                    true
                } else {
                    slot.entry.status = EntryStatus::Stale;
                    false
                }
            };

            trace!(key = %key, in_flight, "cache: invalidated");
            events.push(CacheEvent::KeyInvalidated { key: key.clone() });
            if !in_flight && self.subscriber_count(key) > 0 {
                to_fetch.push(key.clone());
            }
        }

        self.bus.publish(events);
        for key in to_fetch {
            self.begin(&key, true);
        }
    }

    /// Watch `key`. Dropping the returned [`Subscription`] unsubscribes.
    ///
    /// The first subscriber of a missing, stale or failed entry triggers a
    /// fetch when a loader is registered.
    pub fn subscribe<F>(&self, key: QueryKey, notify: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let needs_fetch = {
            let mut slot = self.slot_mut(&key);
            slot.idle_since = None;
            slot.loader.is_some() && slot.entry.needs_fetch()
        };

        let first = self.subscriber_count(&key) == 0;
        let inner = self.bus.subscribe(key.clone(), Arc::new(notify));
        debug!(key = %key, first, "cache: subscribed");

        if first && needs_fetch {
            self.begin(&key, true);
        }

        let store = self.this.clone();
        Subscription {
            key,
            inner: Some(inner),
            on_release: Some(Box::new(move |key: &QueryKey| {
                if let Some(store) = store.upgrade() {
                    store.released(key);
                }
            })),
        }
    }

    fn released(&self, key: &QueryKey) {
        if self.subscriber_count(key) > 0 {
            return;
        }
        if let Some(mut slot) = self.slots.get_mut(key) {
            slot.idle_since = Some(Instant::now());
        }
        debug!(key = %key, "cache: last subscriber left");
    }

    /// Write fetched data directly, as if a fetch had just succeeded.
    pub fn set_data(&self, key: &QueryKey, value: V) {
        {
            let mut slot = self.slot_mut(key);
            slot.entry.data = Some(value);
            slot.entry.status = EntryStatus::Fresh;
            slot.entry.last_fetched_at = Some(Instant::now());
            slot.entry.error = None;
            slot.optimistic_seq = None;
            slot.discarded_fetch = false;
        }
        self.notify_updated(key);
    }

    /// Apply an optimistic change and return the exact prior state.
    ///
    /// `f` receives the current data and returns the replacement, or `None`
    /// to leave the entry untouched. Fetches issued before this call will
    /// not overwrite the patched data.
    pub fn patch<F>(&self, key: &QueryKey, f: F) -> EntrySnapshot<V>
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let (snapshot, changed) = {
            let mut slot = self.slot_mut(key);
            let snapshot = slot.snapshot();
            match f(slot.entry.data.as_ref()) {
                Some(next) => {
                    slot.entry.data = Some(next);
                    slot.optimistic_seq = Some(self.next_seq());
                    (snapshot, true)
                }
                None => (snapshot, false),
            }
        };

        if changed {
            trace!(key = %key, "cache: optimistic patch applied");
            self.notify_updated(key);
        }
        snapshot
    }

    /// Put back a state captured by [`CacheStore::patch`].
    ///
    /// The data is restored exactly. The status is not when the world moved
    /// on while the patch was live: a fetch still running keeps the entry
    /// `Loading`, and a snapshot taken mid-fetch, or one whose refresh was
    /// discarded in favor of the patch, comes back `Stale` (`Idle` when
    /// empty). A subscribed key that then needs data is refetched.
    pub fn restore(&self, key: &QueryKey, snapshot: EntrySnapshot<V>) {
        let needs_fetch = {
            let mut slot = self.slot_mut(key);
            let discarded = std::mem::take(&mut slot.discarded_fetch);
            let status = if slot.in_flight.is_some() {
                EntryStatus::Loading
            } else if discarded || snapshot.status == EntryStatus::Loading {
                if snapshot.data.is_some() {
                    EntryStatus::Stale
                } else {
                    EntryStatus::Idle
                }
            } else {
                snapshot.status
            };

            slot.entry.data = snapshot.data;
            slot.entry.status = status;
            slot.entry.last_fetched_at = snapshot.last_fetched_at;
            slot.entry.error = snapshot.error;
            slot.optimistic_seq = None;
            slot.loader.is_some() && slot.entry.needs_fetch()
        };
        debug!(key = %key, "cache: restored snapshot");
        self.notify_updated(key);

        if needs_fetch && self.subscriber_count(key) > 0 {
            debug!(key = %key, "cache: refetching after rollback");
            self.begin(key, true);
        }
    }

    /// Remove an unobserved entry. Returns false if it has subscribers.
    pub fn evict(&self, key: &QueryKey) -> bool {
        if self.subscriber_count(key) > 0 {
            return false;
        }
        self.slots.remove(key).is_some()
    }

    /// Remove entries unobserved for longer than the retention window.
    ///
    /// Does nothing when no retention window is configured.
    pub fn evict_idle(&self) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };

        let expired: Vec<QueryKey> = self
            .slots
            .iter()
            .filter(|slot| {
                slot.in_flight.is_none()
                    && slot
                        .idle_since
                        .is_some_and(|since| since.elapsed() >= retention)
            })
            .map(|slot| slot.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired {
            if self.evict(&key) {
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!(evicted, "cache: evicted idle entries");
        }
        evicted
    }
}

async fn run_fetch<V>(
    store: Weak<CacheStore<V>>,
    key: QueryKey,
    seq: u64,
    started_at: Instant,
    loader: Loader<V>,
) -> Result<V, SyncError>
where
    V: Clone + Send + Sync + 'static,
{
    let result = loader().await;
    match store.upgrade() {
        Some(store) => store.settle(&key, seq, started_at, result),
        None => result.map(FetchOutcome::into_value),
    }
}

/// A registration created by [`CacheStore::subscribe`].
pub struct Subscription {
    key: QueryKey,
    inner: Option<BusSubscription>,
    on_release: Option<Box<dyn FnOnce(&QueryKey) + Send + Sync>>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.unsubscribe();
        }
        if let Some(on_release) = self.on_release.take() {
            on_release(&self.key);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}
