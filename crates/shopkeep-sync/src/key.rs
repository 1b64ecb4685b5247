//! Query keys.

use std::fmt;

/// Identifies a cached resource: a resource class plus optional instance
/// segments, e.g. `chats` or `messages/chat-1`.
///
/// Keys are compared by value only; nothing in the cache interprets them
/// beyond identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    /// Create a key for a resource class.
    pub fn new(resource: impl Into<String>) -> Self {
        Self(vec![resource.into()])
    }

    /// Append an instance segment.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.0.push(id.into());
        self
    }

    /// Build a key from raw segments.
    pub fn from_segments<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The resource class (first segment).
    pub fn resource(&self) -> &str {
        self.0.first().map(String::as_str).unwrap_or_default()
    }

    /// The instance id (second segment), if any.
    pub fn id(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<&str> for QueryKey {
    fn from(resource: &str) -> Self {
        Self::new(resource)
    }
}

impl<const N: usize> From<[&str; N]> for QueryKey {
    fn from(segments: [&str; N]) -> Self {
        Self::from_segments(segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_key_parts() {
        let key = QueryKey::new("messages").with_id("chat-1");
        assert_eq!(key.resource(), "messages");
        assert_eq!(key.id(), Some("chat-1"));
        assert_eq!(key.to_string(), "messages/chat-1");

        let chats = QueryKey::from("chats");
        assert_eq!(chats.id(), None);
        assert_eq!(chats.to_string(), "chats");
    }

    #[test]
    fn test_key_identity() {
        let a = QueryKey::from(["messages", "chat-1"]);
        let b = QueryKey::new("messages").with_id("chat-1");
        let c = QueryKey::new("messages").with_id("chat-2");
        assert_eq!(a, b);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_segment_order_matters() {
        assert_ne!(
            QueryKey::from(["a", "b"]),
            QueryKey::from(["b", "a"])
        );
    }
}
