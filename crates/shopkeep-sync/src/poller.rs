//! Per-key background refresh.
//!
//! Each polled key gets one timer task. The task invalidates the key once
//! the interval has passed since its last successful fetch, and ends as soon
//! as it wakes up to find nobody subscribed.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace, warn};

use crate::{CacheStore, QueryKey};

struct PollTimer {
    interval: Duration,
    handle: JoinHandle<()>,
}

/// Owner of every polling timer, keyed by resource.
pub struct Poller<V> {
    store: Arc<CacheStore<V>>,
    timers: DashMap<QueryKey, PollTimer>,
}

impl<V> Poller<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(store: Arc<CacheStore<V>>) -> Arc<Self> {
        Arc::new(Self {
            store,
            timers: DashMap::new(),
        })
    }

    /// Poll `key` every `interval`. Restarting with the same interval while
    /// the timer is alive is a no-op. Outside a tokio runtime nothing is
    /// started.
    pub fn start(&self, key: QueryKey, interval: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "poller: no runtime, not polling");
            return;
        };

        if let Some(timer) = self.timers.get(&key)
            && timer.interval == interval
            && !timer.handle.is_finished()
        {
            return;
        }

        self.stop(&key);

        let handle = runtime.spawn(poll_loop(
            Arc::downgrade(&self.store),
            key.clone(),
            interval,
        ));
        debug!(key = %key, interval_ms = interval.as_millis() as u64, "poller: started");
        self.timers.insert(key, PollTimer { interval, handle });
    }

    /// Cancel the timer for `key`. Returns true if one was running.
    pub fn stop(&self, key: &QueryKey) -> bool {
        match self.timers.remove(key) {
            Some((_, timer)) => {
                let was_running = !timer.handle.is_finished();
                timer.handle.abort();
                if was_running {
                    debug!(key = %key, "poller: stopped");
                }
                was_running
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let keys: Vec<QueryKey> = self.timers.iter().map(|t| t.key().clone()).collect();
        for key in keys {
            self.stop(&key);
        }
    }

    pub fn is_polling(&self, key: &QueryKey) -> bool {
        self.timers
            .get(key)
            .is_some_and(|timer| !timer.handle.is_finished())
    }

    pub fn interval(&self, key: &QueryKey) -> Option<Duration> {
        self.timers.get(key).map(|timer| timer.interval)
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }
}

impl<V> Drop for Poller<V> {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.handle.abort();
        }
    }
}

async fn poll_loop<V>(store: Weak<CacheStore<V>>, key: QueryKey, interval: Duration)
where
    V: Clone + Send + Sync + 'static,
{
    let mut last_tick = Instant::now();

    loop {
        let deadline = {
            let Some(store) = store.upgrade() else {
                break;
            };
            last_success(&store, &key).map_or(last_tick, |at| at.max(last_tick)) + interval
        };

        sleep_until(deadline).await;

        let Some(store) = store.upgrade() else {
            break;
        };

        // Another fetch may have landed while we slept.
        if let Some(at) = last_success(&store, &key)
            && at + interval > Instant::now()
        {
            continue;
        }

        if store.subscriber_count(&key) == 0 {
            debug!(key = %key, "poller: no subscribers left, ending timer");
            break;
        }

        last_tick = Instant::now();
        trace!(key = %key, "poller: interval elapsed, invalidating");
        store.invalidate(std::slice::from_ref(&key));
    }
}

fn last_success<V>(store: &CacheStore<V>, key: &QueryKey) -> Option<Instant>
where
    V: Clone + Send + Sync + 'static,
{
    store.get(key).and_then(|entry| entry.last_fetched_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FetchOutcome, InvalidationBus, Loader, loader};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn counting(calls: &Arc<AtomicUsize>) -> Loader<u32> {
        let calls = Arc::clone(calls);
        loader(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) as u32;
            async move { Ok(FetchOutcome::Fresh(n)) }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_while_subscribed() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(Arc::clone(&store));
        let key = QueryKey::new("chats");
        let calls = Arc::new(AtomicUsize::new(0));
        store.register_loader(&key, counting(&calls));

        let _sub = store.subscribe(key.clone(), |_| {});
        poller.start(key.clone(), Duration::from_secs(5));
        sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(poller.is_polling(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_ends_after_last_unsubscribe() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(Arc::clone(&store));
        let key = QueryKey::new("messages").with_id("chat-1");
        let calls = Arc::new(AtomicUsize::new(0));
        store.register_loader(&key, counting(&calls));

        let sub = store.subscribe(key.clone(), |_| {});
        poller.start(key.clone(), Duration::from_secs(5));
        sleep(Duration::from_millis(100)).await;
        drop(sub);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!poller.is_polling(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_timer() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(Arc::clone(&store));
        let key = QueryKey::new("chats");
        let calls = Arc::new(AtomicUsize::new(0));
        store.register_loader(&key, counting(&calls));

        let _sub = store.subscribe(key.clone(), |_| {});
        poller.start(key.clone(), Duration::from_secs(5));
        assert!(poller.stop(&key));
        assert!(!poller.stop(&key));

        sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_intervals() {
        let store = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(Arc::clone(&store));
        let chats = QueryKey::new("chats");
        let messages = QueryKey::new("messages").with_id("chat-1");
        let chat_calls = Arc::new(AtomicUsize::new(0));
        let message_calls = Arc::new(AtomicUsize::new(0));
        store.register_loader(&chats, counting(&chat_calls));
        store.register_loader(&messages, counting(&message_calls));

        let _a = store.subscribe(chats.clone(), |_| {});
        let _b = store.subscribe(messages.clone(), |_| {});
        poller.start(chats.clone(), Duration::from_secs(10));
        poller.start(messages.clone(), Duration::from_secs(5));

        sleep(Duration::from_millis(20_100)).await;
        assert_eq!(chat_calls.load(Ordering::SeqCst), 3);
        assert_eq!(message_calls.load(Ordering::SeqCst), 5);
        assert_eq!(poller.interval(&messages), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_start_outside_runtime_does_nothing() {
        let store: Arc<CacheStore<u32>> = CacheStore::new(InvalidationBus::new(), None);
        let poller = Poller::new(store);
        let key = QueryKey::new("chats");

        poller.start(key.clone(), Duration::from_secs(5));
        assert!(!poller.is_polling(&key));
        assert!(!poller.stop(&key));
    }
}
