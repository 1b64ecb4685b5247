//! Writes with optimistic updates, rollback and staggered revalidation.
//!
//! The backend may append a second record (an automated reply) shortly after
//! acknowledging a write. A single refetch right after the write would race
//! it, so affected keys are invalidated again after each configured delay.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::entry::EntrySnapshot;
use crate::notice::{NoticeBoard, NoticeLevel};
use crate::{CacheStore, QueryKey, SyncError};

/// Local change applied to each affected key before the write resolves.
///
/// Receives the key and its current data; returns the replacement, or
/// `None` to leave that key alone.
pub type OptimisticPatch<V> = Arc<dyn Fn(&QueryKey, Option<&V>) -> Option<V> + Send + Sync>;

/// Build an [`OptimisticPatch`] from a closure.
pub fn optimistic<V, F>(f: F) -> OptimisticPatch<V>
where
    F: Fn(&QueryKey, Option<&V>) -> Option<V> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Where a mutation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Applying,
    InFlight,
    Succeeded,
    Failed,
}

/// Bookkeeping for one mutation, dropped when it settles.
struct MutationRecord {
    id: u64,
    name: String,
    affected_keys: Vec<QueryKey>,
    state: MutationState,
    /// When the optimistic patch was applied.
    applied_at: Option<Instant>,
}

impl MutationRecord {
    fn new(id: u64, name: &str, affected_keys: &[QueryKey]) -> Self {
        Self {
            id,
            name: name.to_string(),
            affected_keys: affected_keys.to_vec(),
            state: MutationState::Pending,
            applied_at: None,
        }
    }

    fn transition(&mut self, state: MutationState) {
        debug!(id = self.id, mutation = %self.name, from = ?self.state, to = ?state, "mutation state");
        self.state = state;
    }
}

/// A started mutation that has not settled yet.
///
/// Dropping it while still armed (the `perform` future was cancelled before
/// the write resolved) restores every snapshot and releases the in-flight
/// count.
struct Unsettled<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    store: &'a CacheStore<V>,
    in_flight: &'a AtomicUsize,
    snapshots: Vec<(QueryKey, EntrySnapshot<V>)>,
    armed: bool,
}

impl<'a, V> Unsettled<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn start(store: &'a CacheStore<V>, in_flight: &'a AtomicUsize) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            store,
            in_flight,
            snapshots: Vec::new(),
            armed: true,
        }
    }

    /// The write resolved; hand back the snapshots for the caller to use.
    fn settle(mut self) -> Vec<(QueryKey, EntrySnapshot<V>)> {
        self.armed = false;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        std::mem::take(&mut self.snapshots)
    }
}

impl<V> Drop for Unsettled<'_, V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if !self.snapshots.is_empty() {
            warn!(keys = self.snapshots.len(), "mutation cancelled before settling, rolling back");
        }
        for (key, snapshot) in self.snapshots.drain(..).rev() {
            self.store.restore(&key, snapshot);
        }
    }
}

/// Runs writes against the backend and keeps the cache coherent around them.
pub struct MutationCoordinator<V> {
    store: Arc<CacheStore<V>>,
    revalidate_delays: Vec<Duration>,
    notices: Option<Arc<NoticeBoard>>,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
}

impl<V> MutationCoordinator<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>, revalidate_delays: Vec<Duration>) -> Self {
        Self {
            store,
            revalidate_delays,
            notices: None,
            next_id: AtomicU64::new(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Post failures to `notices` in addition to returning them.
    pub fn with_notices(mut self, notices: Arc<NoticeBoard>) -> Self {
        self.notices = Some(notices);
        self
    }

    /// Number of mutations that have started but not settled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn revalidate_delays(&self) -> &[Duration] {
        &self.revalidate_delays
    }

    /// Run `mutation`, keeping `affected_keys` consistent around it.
    ///
    /// With a patch, each affected entry is snapshotted and patched before
    /// the write starts. On success the keys are invalidated immediately and
    /// again after each revalidation delay. On failure, or when the returned
    /// future is dropped before the write resolves, every snapshot is
    /// restored and the failure is returned.
    #[tracing::instrument(skip_all, fields(mutation = name))]
    pub async fn perform<R, E, F, Fut>(
        &self,
        name: &str,
        mutation: F,
        affected_keys: &[QueryKey],
        patch: Option<OptimisticPatch<V>>,
    ) -> Result<R, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: std::fmt::Display,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut record = MutationRecord::new(id, name, affected_keys);
        let mut unsettled = Unsettled::start(&self.store, &self.in_flight);

        if let Some(patch) = patch {
            record.transition(MutationState::Applying);
            for key in affected_keys {
                let snapshot = self.store.patch(key, |current| patch(key, current));
                unsettled.snapshots.push((key.clone(), snapshot));
            }
            record.applied_at = Some(Instant::now());
        }

        record.transition(MutationState::InFlight);
        let result = mutation().await;
        let snapshots = unsettled.settle();

        match result {
            Ok(value) => {
                record.transition(MutationState::Succeeded);
                self.store.invalidate(&record.affected_keys);
                self.schedule_revalidation(record.affected_keys);
                Ok(value)
            }
            Err(err) => {
                record.transition(MutationState::Failed);
                let patched_ms = record
                    .applied_at
                    .map(|at| at.elapsed().as_millis() as u64);
                warn!(id, error = %err, ?patched_ms, "mutation failed, rolling back");
                for (key, snapshot) in snapshots.into_iter().rev() {
                    self.store.restore(&key, snapshot);
                }
                let error = SyncError::mutation(name, &err);
                if let Some(notices) = &self.notices {
                    notices.push(NoticeLevel::Error, error.to_string());
                }
                Err(error)
            }
        }
    }

    fn schedule_revalidation(&self, keys: Vec<QueryKey>) {
        if self.revalidate_delays.is_empty() || keys.is_empty() {
            return;
        }

        let Ok(handle) = Handle::try_current() else {
            warn!(keys = keys.len(), "no runtime, skipping staggered revalidation");
            return;
        };

        let store = Arc::clone(&self.store);
        let delays = self.revalidate_delays.clone();
        let start = Instant::now();

        handle.spawn(async move {
            for delay in delays {
                sleep_until(start + delay).await;
                debug!(delay_ms = delay.as_millis() as u64, keys = keys.len(), "staggered revalidation");
                store.invalidate(&keys);
            }
            info!(keys = keys.len(), "staggered revalidation complete");
        });
    }
}
