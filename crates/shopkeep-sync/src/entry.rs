//! Cache entries and their status.

use tokio::time::Instant;

use crate::SyncError;

/// Lifecycle status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    /// Created but never fetched.
    Idle,
    /// First fetch in progress.
    Loading,
    /// Holds data from the most recent successful fetch.
    Fresh,
    /// Data may be outdated and should be refetched when next observed.
    Stale,
    /// The last fetch failed; `data` is whatever was shown before, or the
    /// fallback value.
    Error,
}

/// Snapshot of what the UI currently believes about one key.
///
/// Callers always receive clones; the store owns the canonical value.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub data: Option<V>,
    pub status: EntryStatus,
    /// When the request that produced `data` was issued.
    pub last_fetched_at: Option<Instant>,
    pub error: Option<SyncError>,
    pub in_flight: bool,
}

impl<V> CacheEntry<V> {
    pub(crate) fn idle() -> Self {
        Self {
            data: None,
            status: EntryStatus::Idle,
            last_fetched_at: None,
            error: None,
            in_flight: false,
        }
    }

    /// Whether data can be served without a refetch.
    pub fn is_fresh(&self) -> bool {
        self.status == EntryStatus::Fresh && self.data.is_some()
    }

    /// Whether the next observer should trigger a fetch.
    pub fn needs_fetch(&self) -> bool {
        match self.status {
            EntryStatus::Idle | EntryStatus::Stale | EntryStatus::Error => !self.in_flight,
            EntryStatus::Loading | EntryStatus::Fresh => false,
        }
    }
}

/// Exact prior state of an entry, captured before an optimistic patch so a
/// rollback can put it back without a network round trip.
#[derive(Debug, Clone)]
pub struct EntrySnapshot<V> {
    pub(crate) data: Option<V>,
    pub(crate) status: EntryStatus,
    pub(crate) last_fetched_at: Option<Instant>,
    pub(crate) error: Option<SyncError>,
}

impl<V> EntrySnapshot<V> {
    pub fn data(&self) -> Option<&V> {
        self.data.as_ref()
    }
}
