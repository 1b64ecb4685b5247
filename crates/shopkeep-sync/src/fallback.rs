//! Substitute data for unreachable or demonstration resources.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::{FetchOutcome, LoadResult, QueryKey, SyncError};

/// Default id prefix that marks a demonstration resource.
pub const DEFAULT_DEMO_PREFIX: &str = "demo-";

/// Supplies deterministic data for a key.
pub trait FallbackSource<V>: Send + Sync {
    fn resolve(&self, key: &QueryKey) -> Option<V>;
}

impl<V, F> FallbackSource<V> for F
where
    F: Fn(&QueryKey) -> Option<V> + Send + Sync,
{
    fn resolve(&self, key: &QueryKey) -> Option<V> {
        self(key)
    }
}

/// Fixed key-to-value dataset.
#[derive(Debug, Clone, Default)]
pub struct StaticDataset<V> {
    values: HashMap<QueryKey, V>,
}

impl<V> StaticDataset<V> {
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
        }
    }

    pub fn with(mut self, key: QueryKey, value: V) -> Self {
        self.values.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: QueryKey, value: V) {
        self.values.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<V: Clone + Send + Sync> FallbackSource<V> for StaticDataset<V> {
    fn resolve(&self, key: &QueryKey) -> Option<V> {
        self.values.get(key).cloned()
    }
}

/// Decides when a key must be served from substitute data.
///
/// Demo keys (instance id starting with the reserved prefix) are answered
/// from the source before any network call is considered. For every other
/// key the source only provides the value handed to the fetcher as its
/// fallback.
pub struct FallbackProvider<V> {
    demo_prefix: String,
    source: Arc<dyn FallbackSource<V>>,
}

impl<V> Clone for FallbackProvider<V> {
    fn clone(&self) -> Self {
        Self {
            demo_prefix: self.demo_prefix.clone(),
            source: Arc::clone(&self.source),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> FallbackProvider<V> {
    pub fn new(demo_prefix: impl Into<String>, source: impl FallbackSource<V> + 'static) -> Self {
        Self {
            demo_prefix: demo_prefix.into(),
            source: Arc::new(source),
        }
    }

    /// Use a source that the caller keeps a handle to (e.g. a writable demo
    /// dataset).
    pub fn from_shared(demo_prefix: impl Into<String>, source: Arc<dyn FallbackSource<V>>) -> Self {
        Self {
            demo_prefix: demo_prefix.into(),
            source,
        }
    }

    /// A provider with no data; only the demo policy applies.
    pub fn empty(demo_prefix: impl Into<String>) -> Self {
        Self::new(demo_prefix, |_: &QueryKey| None)
    }

    pub fn demo_prefix(&self) -> &str {
        &self.demo_prefix
    }

    /// Whether `key` names a demonstration resource.
    pub fn is_demo(&self, key: &QueryKey) -> bool {
        !self.demo_prefix.is_empty()
            && key
                .id()
                .is_some_and(|id| id.starts_with(self.demo_prefix.as_str()))
    }

    /// Substitute value for `key`, if the dataset has one.
    pub fn resolve(&self, key: &QueryKey) -> Option<V> {
        self.source.resolve(key)
    }

    /// Apply the demo policy, then hand the fallback value to `fetch`.
    ///
    /// `fetch` is never called for demo keys.
    pub async fn load<F, Fut>(&self, key: &QueryKey, fetch: F) -> LoadResult<V>
    where
        F: FnOnce(Option<V>) -> Fut,
        Fut: Future<Output = LoadResult<V>>,
    {
        if self.is_demo(key) {
            debug!(key = %key, "serving demo resource without network");
            return match self.resolve(key) {
                Some(value) => Ok(FetchOutcome::Fresh(value)),
                None => Err(SyncError::Unavailable {
                    key: key.clone(),
                    reason: "no demo data for this resource".to_string(),
                }),
            };
        }

        fetch(self.resolve(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn provider() -> FallbackProvider<u32> {
        let dataset = StaticDataset::new()
            .with(QueryKey::new("messages").with_id("demo-1"), 11)
            .with(QueryKey::new("messages").with_id("chat-1"), 22);
        FallbackProvider::new(DEFAULT_DEMO_PREFIX, dataset)
    }

    #[test]
    fn test_is_demo() {
        let p = provider();
        assert!(p.is_demo(&QueryKey::new("messages").with_id("demo-1")));
        assert!(!p.is_demo(&QueryKey::new("messages").with_id("chat-1")));
        assert!(!p.is_demo(&QueryKey::new("chats")));
        assert!(!FallbackProvider::<u32>::empty("").is_demo(&QueryKey::from(["x", "demo-1"])));
    }

    #[tokio::test]
    async fn test_demo_key_never_fetches() {
        let p = provider();
        let calls = AtomicUsize::new(0);
        let key = QueryKey::new("messages").with_id("demo-1");

        let result = p
            .load(&key, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(FetchOutcome::Fresh(0))
            })
            .await;

        assert_eq!(result.unwrap(), FetchOutcome::Fresh(11));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_demo_key_without_data_is_unavailable() {
        let p = provider();
        let key = QueryKey::new("messages").with_id("demo-404");
        let result = p
            .load(&key, |_| async { Ok(FetchOutcome::Fresh(0)) })
            .await;
        assert!(matches!(result, Err(SyncError::Unavailable { .. })));
    }

    #[tokio::test]
    async fn test_regular_key_receives_fallback() {
        let p = provider();
        let key = QueryKey::new("messages").with_id("chat-1");
        let result = p
            .load(&key, |fallback| async move {
                assert_eq!(fallback, Some(22));
                Ok(FetchOutcome::Fresh(5))
            })
            .await;
        assert_eq!(result.unwrap(), FetchOutcome::Fresh(5));
    }
}
