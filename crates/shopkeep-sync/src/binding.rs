//! Component-facing handle: "I need this key, tell me when it changes".

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bus::CacheEvent;
use crate::entry::{CacheEntry, EntryStatus};
use crate::poller::Poller;
use crate::store::{Loader, Subscription};
use crate::{CacheStore, QueryKey, SyncError};

/// A live binding to one query key.
///
/// Holding the handle keeps the key subscribed (and polled, if an interval
/// was given). Dropping it unsubscribes, and stops the key's poll timer when
/// no other handle is watching.
pub struct QueryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    store: Arc<CacheStore<V>>,
    poller: Option<Arc<Poller<V>>>,
    key: QueryKey,
    loader: Loader<V>,
    subscription: Option<Subscription>,
}

impl<V> QueryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Register `loader` for `key`, subscribe with `notify`, and start
    /// polling when `poll_interval` is set.
    ///
    /// The first subscriber of an empty or stale key triggers a fetch, so
    /// the entry is `Loading` right after this returns.
    pub fn bind<F>(
        store: Arc<CacheStore<V>>,
        poller: Option<Arc<Poller<V>>>,
        key: QueryKey,
        loader: Loader<V>,
        poll_interval: Option<Duration>,
        notify: F,
    ) -> Self
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        store.register_loader(&key, Arc::clone(&loader));
        let subscription = store.subscribe(key.clone(), notify);

        if let (Some(poller), Some(interval)) = (&poller, poll_interval) {
            poller.start(key.clone(), interval);
        }

        debug!(key = %key, polled = poll_interval.is_some(), "binding: bound");
        Self {
            store,
            poller,
            key,
            loader,
            subscription: Some(subscription),
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    pub fn entry(&self) -> Option<CacheEntry<V>> {
        self.store.get(&self.key)
    }

    pub fn data(&self) -> Option<V> {
        self.store.data(&self.key)
    }

    pub fn status(&self) -> EntryStatus {
        self.entry().map_or(EntryStatus::Idle, |entry| entry.status)
    }

    /// Mark the key stale; the subscription makes that an immediate refetch.
    pub fn refresh(&self) {
        self.store.invalidate(std::slice::from_ref(&self.key));
    }

    /// Wait for a value: cached fresh data or the fetch in flight.
    pub async fn load(&self) -> Result<V, SyncError> {
        self.store.ensure(&self.key, Arc::clone(&self.loader)).await
    }
}

impl<V> Drop for QueryHandle<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        drop(self.subscription.take());

        if self.store.subscriber_count(&self.key) == 0
            && let Some(poller) = &self.poller
        {
            poller.stop(&self.key);
        }
        debug!(key = %self.key, "binding: released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchOutcome, InvalidationBus, loader};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting(calls: &Arc<AtomicUsize>) -> Loader<u32> {
        let calls = Arc::clone(calls);
        loader(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
            async move {
                sleep(Duration::from_millis(20)).await;
                Ok(FetchOutcome::Fresh(n))
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_fetches_and_notifies() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let key = QueryKey::new("messages").with_id("chat-1");
        let calls = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&events);

        let handle = QueryHandle::bind(
            Arc::clone(&store),
            None,
            key.clone(),
            counting(&calls),
            None,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(handle.status(), EntryStatus::Loading);

        assert_eq!(handle.load().await.unwrap(), 0);
        assert_eq!(handle.status(), EntryStatus::Fresh);
        assert_eq!(handle.data(), Some(0));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_millis(1)).await;
        assert!(events.load(Ordering::SeqCst) >= 1);

        handle.refresh();
        sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.data(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_polling() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(Arc::clone(&store));
        let key = QueryKey::new("chats");
        let calls = Arc::new(AtomicUsize::new(0));

        let handle = QueryHandle::bind(
            Arc::clone(&store),
            Some(Arc::clone(&poller)),
            key.clone(),
            counting(&calls),
            Some(Duration::from_secs(10)),
            |_| {},
        );
        sleep(Duration::from_secs(11)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(poller.is_polling(&key));

        drop(handle);
        assert!(!poller.is_polling(&key));
        assert_eq!(store.subscriber_count(&key), 0);

        sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_key_keeps_polling_until_last_handle() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(Arc::clone(&store));
        let key = QueryKey::new("chats");
        let calls = Arc::new(AtomicUsize::new(0));
        let interval = Some(Duration::from_secs(10));

        let first = QueryHandle::bind(
            Arc::clone(&store),
            Some(Arc::clone(&poller)),
            key.clone(),
            counting(&calls),
            interval,
            |_| {},
        );
        let second = QueryHandle::bind(
            Arc::clone(&store),
            Some(Arc::clone(&poller)),
            key.clone(),
            counting(&calls),
            interval,
            |_| {},
        );

        drop(first);
        assert!(poller.is_polling(&key));
        drop(second);
        assert!(!poller.is_polling(&key));
    }
}
