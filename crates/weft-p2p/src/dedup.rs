//! Bounded memory of gossip identities already relayed.

use lru::LruCache;
use std::num::NonZeroUsize;
use weft_protocol::MessageId;

/// LRU set of [`MessageId`]s.
///
/// Owned by the router task, so check and insert never race.
#[derive(Debug)]
pub struct SeenSet {
    cache: LruCache<MessageId, ()>,
}

impl SeenSet {
    /// Creates a set remembering at most `capacity` identities (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Records `id`. Returns true if it was not already present.
    pub fn insert(&mut self, id: MessageId) -> bool {
        self.cache.put(id, ()).is_none()
    }

    /// Returns true if `id` is present, without touching recency.
    pub fn contains(&self, id: &MessageId) -> bool {
        self.cache.contains(id)
    }

    /// Number of remembered identities.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
