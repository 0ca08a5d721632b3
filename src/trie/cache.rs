//! Bounded cache of decoded nodes

use crate::model::{Hash, JmtNode, NodeKey};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A decoded node with its commitment as stored
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedNode {
    pub node: JmtNode,
    pub hash: Hash,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Inner {
    /// `None` when the cache is disabled
    entries: Option<LruCache<NodeKey, Arc<LoadedNode>>>,
    hits: u64,
    misses: u64,
}

/// Least-recently-used node cache. Nodes are immutable per key, so a cached
/// entry is only wrong once the collector deletes the node; callers clear
/// the cache after collection.
pub struct NodeCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl NodeCache {
    /// A capacity of 0 disables caching
    pub fn new(capacity: usize) -> Self {
        NodeCache {
            capacity,
            inner: Mutex::new(Inner {
                entries: NonZeroUsize::new(capacity).map(LruCache::new),
                hits: 0,
                misses: 0,
            }),
        }
    }

    pub fn get(&self, key: &NodeKey) -> Option<Arc<LoadedNode>> {
        let mut inner = self.inner.lock();
        let found = inner.entries.as_mut().and_then(|lru| lru.get(key).cloned());
        if found.is_some() {
            inner.hits += 1;
        } else {
            inner.misses += 1;
        }
        found
    }

    pub fn insert(&self, key: NodeKey, node: Arc<LoadedNode>) {
        if let Some(lru) = self.inner.lock().entries.as_mut() {
            lru.put(key, node);
        }
    }

    pub fn clear(&self) {
        if let Some(lru) = self.inner.lock().entries.as_mut() {
            lru.clear();
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.as_ref().map_or(0, |lru| lru.len()),
            capacity: self.capacity,
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LeafNode;

    fn loaded(byte: u8) -> Arc<LoadedNode> {
        Arc::new(LoadedNode {
            node: JmtNode::Leaf(LeafNode {
                key_hash: Hash::from_bytes([byte; 32]),
                value_hash: Hash::ZERO,
            }),
            hash: Hash::from_bytes([byte; 32]),
        })
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = NodeCache::new(2);
        cache.insert(NodeKey::root(1), loaded(1));
        cache.insert(NodeKey::root(2), loaded(2));
        // touching 1 makes 2 the eviction candidate
        assert!(cache.get(&NodeKey::root(1)).is_some());
        cache.insert(NodeKey::root(3), loaded(3));

        assert!(cache.get(&NodeKey::root(2)).is_none());
        assert!(cache.get(&NodeKey::root(1)).is_some());
        assert!(cache.get(&NodeKey::root(3)).is_some());
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.hits, stats.misses), (2, 3, 1));
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = NodeCache::new(0);
        cache.insert(NodeKey::root(1), loaded(1));
        assert!(cache.get(&NodeKey::root(1)).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_clear() {
        let cache = NodeCache::new(8);
        cache.insert(NodeKey::root(1), loaded(1));
        cache.clear();
        assert_eq!(cache.stats().entries, 0);
    }
}
