//! Typed publish/subscribe for cache events.
//!
//! Events published during one scheduling tick are queued and delivered
//! together in a single pass, so a mutation that touches a list key and an
//! item key (or invalidates the same key twice) wakes each subscriber once
//! per distinct event.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::trace;

use crate::QueryKey;

/// Event delivered to subscribers of a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheEvent {
    /// The key was marked stale; a refetch may follow.
    KeyInvalidated { key: QueryKey },
    /// The key's entry changed (new data, status change, patch or rollback).
    KeyUpdated { key: QueryKey },
}

impl CacheEvent {
    pub fn key(&self) -> &QueryKey {
        match self {
            Self::KeyInvalidated { key } | Self::KeyUpdated { key } => key,
        }
    }
}

/// Callback invoked for each delivered event.
pub type EventHandler = Arc<dyn Fn(&CacheEvent) + Send + Sync + 'static>;

#[derive(Default)]
struct Pending {
    events: Vec<CacheEvent>,
    seen: HashSet<CacheEvent>,
    flush_scheduled: bool,
}

/// Event bus keyed by [`QueryKey`].
pub struct InvalidationBus {
    handlers: DashMap<QueryKey, Vec<(u64, EventHandler)>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
}

impl InvalidationBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: DashMap::new(),
            pending: Mutex::new(Pending::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a handler for events on `key`.
    ///
    /// The handler stays registered until the returned value is dropped or
    /// [`BusSubscription::unsubscribe`] is called.
    pub fn subscribe(self: &Arc<Self>, key: QueryKey, handler: EventHandler) -> BusSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(key.clone())
            .or_default()
            .push((id, handler));
        trace!(key = %key, id, "bus: subscribed");

        BusSubscription {
            bus: Arc::downgrade(self),
            key,
            id,
            active: true,
        }
    }

    /// Number of live handlers for `key`.
    pub fn subscriber_count(&self, key: &QueryKey) -> usize {
        self.handlers.get(key).map(|h| h.len()).unwrap_or(0)
    }

    /// Queue events for delivery.
    ///
    /// Inside a tokio runtime delivery happens on a spawned task, after the
    /// publishing task yields; duplicates queued before then are dropped.
    /// Outside a runtime events are delivered before this returns.
    pub fn publish(self: &Arc<Self>, events: impl IntoIterator<Item = CacheEvent>) {
        let schedule = {
            let mut pending = self.pending.lock();
            for event in events {
                if pending.seen.insert(event.clone()) {
                    pending.events.push(event);
                }
            }
            if pending.flush_scheduled || pending.events.is_empty() {
                false
            } else {
                pending.flush_scheduled = true;
                true
            }
        };

        if !schedule {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let bus = Arc::clone(self);
                handle.spawn(async move { bus.flush() });
            }
            Err(_) => {
                self.flush();
            }
        }
    }

    /// Deliver everything queued so far, synchronously.
    ///
    /// Returns the number of distinct events delivered.
    pub fn flush(&self) -> usize {
        let events = {
            let mut pending = self.pending.lock();
            pending.flush_scheduled = false;
            pending.seen.clear();
            std::mem::take(&mut pending.events)
        };

        for event in &events {
            // Clone the handler list so no map guard is held while user code runs.
            let handlers: Vec<EventHandler> = match self.handlers.get(event.key()) {
                Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => continue,
            };
            trace!(key = %event.key(), handlers = handlers.len(), ?event, "bus: delivering");
            for handler in handlers {
                handler(event);
            }
        }

        events.len()
    }

    fn remove(&self, key: &QueryKey, id: u64) {
        let now_empty = match self.handlers.get_mut(key) {
            Some(mut list) => {
                list.retain(|(hid, _)| *hid != id);
                list.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.handlers.remove_if(key, |_, list| list.is_empty());
        }
        trace!(key = %key, id, "bus: unsubscribed");
    }
}

/// Handle for a bus registration; unsubscribes on drop.
pub struct BusSubscription {
    bus: Weak<InvalidationBus>,
    key: QueryKey,
    id: u64,
    active: bool,
}

impl BusSubscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Remove the handler now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.key, self.id);
        }
    }
}

impl Drop for BusSubscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for BusSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusSubscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handler: EventHandler = Arc::new(move |_: &CacheEvent| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[tokio::test]
    async fn test_publish_coalesces_within_tick() {
        let bus = InvalidationBus::new();
        let key = QueryKey::new("chats");
        let (count, handler) = counter();
        let _sub = bus.subscribe(key.clone(), handler);

        bus.publish([CacheEvent::KeyInvalidated { key: key.clone() }]);
        bus.publish([
            CacheEvent::KeyInvalidated { key: key.clone() },
            CacheEvent::KeyInvalidated { key: key.clone() },
        ]);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_each_delivered() {
        let bus = InvalidationBus::new();
        let chats = QueryKey::new("chats");
        let messages = QueryKey::new("messages").with_id("chat-1");
        let (chat_count, chat_handler) = counter();
        let (msg_count, msg_handler) = counter();
        let _a = bus.subscribe(chats.clone(), chat_handler);
        let _b = bus.subscribe(messages.clone(), msg_handler);

        bus.publish([
            CacheEvent::KeyInvalidated { key: chats.clone() },
            CacheEvent::KeyInvalidated { key: messages.clone() },
            CacheEvent::KeyUpdated { key: messages },
        ]);
        assert_eq!(bus.flush(), 3);

        assert_eq!(chat_count.load(Ordering::SeqCst), 1);
        assert_eq!(msg_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let bus = InvalidationBus::new();
        let key = QueryKey::new("chats");
        let (count, handler) = counter();
        let sub = bus.subscribe(key.clone(), handler);
        assert_eq!(bus.subscriber_count(&key), 1);

        drop(sub);
        assert_eq!(bus.subscriber_count(&key), 0);

        bus.publish([CacheEvent::KeyUpdated { key }]);
        bus.flush();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_publish_without_runtime_delivers_immediately() {
        let bus = InvalidationBus::new();
        let key = QueryKey::new("chats");
        let (count, handler) = counter();
        let _sub = bus.subscribe(key.clone(), handler);

        bus.publish([CacheEvent::KeyUpdated { key }]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_may_unsubscribe_during_delivery() {
        let bus = InvalidationBus::new();
        let key = QueryKey::new("chats");
        let slot: Arc<Mutex<Option<BusSubscription>>> = Arc::new(Mutex::new(None));
        let slot_in = Arc::clone(&slot);
        let sub = bus.subscribe(
            key.clone(),
            Arc::new(move |_: &CacheEvent| {
                slot_in.lock().take();
            }),
        );
        *slot.lock() = Some(sub);

        bus.publish([CacheEvent::KeyUpdated { key: key.clone() }]);
        bus.flush();
        assert_eq!(bus.subscriber_count(&key), 0);
    }
}
