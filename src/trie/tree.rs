//! Versioned sparse Merkle trie over a [`NodeStore`]

use super::cache::{CacheStats, LoadedNode, NodeCache};
use crate::commitment::{ClassicCommitment, CommitmentScheme};
use crate::model::nibble::MAX_NIBBLES;
use crate::model::{
    nibble_at, Child, Hash, HashFunction, InternalNode, JmtNode, LeafNode, NibblePath, NodeKey,
    NodeKind,
};
use crate::proof::{ProofKind, TrieProof};
use crate::store::{CommitBatch, CommitConfig, KvNodeStore, NodeStore, RootsIndex, StoredNode};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// What a commit wrote
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CommitOutcome {
    pub version: u64,
    pub root_hash: Hash,
    pub nodes_written: usize,
    pub stale_marked: usize,
    pub values_written: usize,
    pub values_deleted: usize,
}

/// A leaf being placed, and where it lives today if it already exists
#[derive(Clone, Debug)]
struct LeafEntry {
    leaf: LeafNode,
    origin: Option<NodeKey>,
}

enum Op {
    Put(LeafEntry),
    Delete(Hash),
}

impl Op {
    fn key_hash(&self) -> &Hash {
        match self {
            Op::Put(entry) => &entry.leaf.key_hash,
            Op::Delete(key_hash) => key_hash,
        }
    }
}

/// Result of updating the subtree at one position
enum Subtree {
    Empty,
    /// A single leaf, not yet placed: the parent decides its depth
    Leaf(LeafEntry),
    /// An internal node already persisted (new or untouched)
    Internal(Child),
}

/// State of one commit pass
struct Pass<'s> {
    batch: CommitBatch<'s>,
    version: u64,
    scheme: &'s dyn CommitmentScheme,
    values_deleted: usize,
}

impl Pass<'_> {
    fn stale(&mut self, key: NodeKey) -> Result<()> {
        self.batch.mark_stale(key)
    }

    /// Write `entry` at `at`, or keep it in place when it already lives there
    fn place_leaf(&mut self, entry: LeafEntry, at: &NibblePath, reuse: bool) -> Result<Child> {
        let node = JmtNode::Leaf(entry.leaf);
        let hash = node.hash(self.scheme);
        if let Some(origin) = entry.origin {
            if reuse && origin.path() == at {
                return Ok(Child {
                    hash,
                    version: origin.version(),
                    kind: NodeKind::Leaf,
                });
            }
            self.stale(origin)?;
        }
        self.batch.put_node(
            NodeKey::new(at.clone(), self.version),
            StoredNode::new(hash, node.encode()),
        )?;
        Ok(Child {
            hash,
            version: self.version,
            kind: NodeKind::Leaf,
        })
    }

    fn write_internal(&mut self, at: &NibblePath, node: InternalNode) -> Result<Child> {
        let node = JmtNode::Internal(node);
        let hash = node.hash(self.scheme);
        self.batch.put_node(
            NodeKey::new(at.clone(), self.version),
            StoredNode::new(hash, node.encode()),
        )?;
        Ok(Child {
            hash,
            version: self.version,
            kind: NodeKind::Internal,
        })
    }
}

/// Split items sorted by key hash into runs sharing the nibble at `depth`
fn split_by_nibble<T>(items: Vec<T>, depth: usize, key: impl Fn(&T) -> &Hash) -> Vec<(u8, Vec<T>)> {
    let mut groups: Vec<(u8, Vec<T>)> = Vec::new();
    for item in items {
        let nibble = nibble_at(key(&item), depth);
        match groups.last_mut() {
            Some((n, group)) if *n == nibble => group.push(item),
            _ => groups.push((nibble, vec![item])),
        }
    }
    groups
}

fn puts_only(ops: Vec<Op>) -> Vec<LeafEntry> {
    ops.into_iter()
        .filter_map(|op| match op {
            Op::Put(entry) => Some(entry),
            Op::Delete(_) => None,
        })
        .collect()
}

/// Authenticated key-value map with one immutable tree per committed version.
///
/// Nodes live at `(path, version)`; an update writes new nodes at the target
/// version along every touched path and marks the nodes they replace stale.
/// The tree shape is canonical: an internal node exists exactly where two or
/// more keys share a path prefix, and each leaf sits at the shortest prefix
/// unique to its key. Root hashes therefore depend only on content.
pub struct VersionedTrie<S = KvNodeStore> {
    store: Arc<S>,
    hasher: Arc<dyn HashFunction>,
    scheme: Arc<dyn CommitmentScheme>,
    commit_config: CommitConfig,
    cache: NodeCache,
    /// One writer at a time: a commit is computed against the latest root
    write_lock: Mutex<()>,
}

impl<S: NodeStore + RootsIndex> VersionedTrie<S> {
    /// Engine using the classic commitment over `hasher`
    pub fn new(store: Arc<S>, hasher: Arc<dyn HashFunction>) -> Self {
        let scheme = Arc::new(ClassicCommitment::new(hasher.clone()));
        Self::with_commitment(store, hasher, scheme)
    }

    pub fn with_commitment(
        store: Arc<S>,
        hasher: Arc<dyn HashFunction>,
        scheme: Arc<dyn CommitmentScheme>,
    ) -> Self {
        VersionedTrie {
            store,
            hasher,
            scheme,
            commit_config: CommitConfig::default(),
            cache: NodeCache::new(DEFAULT_CACHE_CAPACITY),
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_commit_config(mut self, config: CommitConfig) -> Self {
        self.commit_config = config;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = NodeCache::new(capacity);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn hasher(&self) -> &Arc<dyn HashFunction> {
        &self.hasher
    }

    pub fn commitment(&self) -> &Arc<dyn CommitmentScheme> {
        &self.scheme
    }

    pub fn key_hash(&self, key: &[u8]) -> Hash {
        self.hasher.digest(key)
    }

    /// Root hash of an empty tree
    pub fn empty_root(&self) -> Hash {
        self.scheme.null_hash()
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        self.store.latest_version()
    }

    /// The smallest version a new commit may use
    pub fn next_version(&self) -> Result<u64> {
        Ok(self.store.latest_version()?.map_or(1, |v| v + 1))
    }

    /// Root hash of the tree visible at `version`; `None` before the first commit
    pub fn root_hash(&self, version: u64) -> Result<Option<Hash>> {
        Ok(self.store.floor(version)?.map(|(_, hash)| hash))
    }

    /// Root hash of the latest tree, the empty root if nothing is committed
    pub fn latest_root_hash(&self) -> Result<Hash> {
        Ok(self
            .store
            .latest()?
            .map_or_else(|| self.empty_root(), |(_, hash)| hash))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop cached nodes, required after nodes were deleted from the store
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Set `key` to `value` at `version`; returns the new root hash
    pub fn insert(&self, key: &[u8], value: &[u8], version: u64) -> Result<Hash> {
        self.apply(version, [(key, Some(value))])
            .map(|outcome| outcome.root_hash)
    }

    /// Remove `key` at `version`; returns the new root hash
    pub fn delete(&self, key: &[u8], version: u64) -> Result<Hash> {
        self.apply(version, [(key, None::<&[u8]>)])
            .map(|outcome| outcome.root_hash)
    }

    /// Commit a set of puts (`Some`) and deletes (`None`) as one version.
    ///
    /// Later entries for the same key win. `version` must exceed every
    /// committed version; an empty update set still commits `version` with
    /// the previous root.
    pub fn apply<I, K, V>(&self, version: u64, updates: I) -> Result<CommitOutcome>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let _writer = self.write_lock.lock();
        let base = self.store.latest()?;
        if let Some((latest, _)) = base {
            if version <= latest {
                return Err(Error::VersionConflict {
                    version,
                    latest: Some(latest),
                });
            }
        }

        let mut by_hash: BTreeMap<Hash, Option<Vec<u8>>> = BTreeMap::new();
        for (key, value) in updates {
            by_hash.insert(
                self.hasher.digest(key.as_ref()),
                value.map(|v| v.as_ref().to_vec()),
            );
        }

        let batch = self.store.begin_commit(version, &self.commit_config)?;
        let mut pass = Pass {
            batch,
            version,
            scheme: self.scheme.as_ref(),
            values_deleted: 0,
        };

        let mut ops = Vec::with_capacity(by_hash.len());
        let mut values_written = 0;
        for (key_hash, value) in by_hash {
            match value {
                Some(value) => {
                    let value_hash = self.hasher.digest(&value);
                    pass.batch.put_value(key_hash, value);
                    values_written += 1;
                    ops.push(Op::Put(LeafEntry {
                        leaf: LeafNode {
                            key_hash,
                            value_hash,
                        },
                        origin: None,
                    }));
                }
                None => ops.push(Op::Delete(key_hash)),
            }
        }

        let existing = match base {
            Some((base_version, root)) if root != self.empty_root() => {
                let key = NodeKey::root(base_version);
                let node = self.load_required(&key)?;
                Some((key, node))
            }
            _ => None,
        };

        let root = NibblePath::empty();
        let subtree = self.apply_at(&mut pass, &root, existing, ops)?;
        let root_hash = self.finish_root(&mut pass, subtree)?;
        pass.batch.set_root_hash(root_hash);

        let outcome = CommitOutcome {
            version,
            root_hash,
            nodes_written: pass.batch.staged_nodes(),
            stale_marked: pass.batch.staged_stale(),
            values_written,
            values_deleted: pass.values_deleted,
        };
        pass.batch.commit()?;
        debug!(
            version,
            root = %root_hash.short(),
            nodes = outcome.nodes_written,
            stale = outcome.stale_marked,
            "applied updates"
        );
        Ok(outcome)
    }

    /// Value of `key` in the tree visible at `version`
    pub fn get(&self, key: &[u8], version: u64) -> Result<Option<Vec<u8>>> {
        let Some((root_version, root)) = self.store.floor(version)? else {
            return Ok(None);
        };
        if root == self.empty_root() {
            return Ok(None);
        }
        let key_hash = self.hasher.digest(key);
        let mut node_key = NodeKey::root(root_version);
        let mut depth = 0;
        loop {
            let loaded = self.load_required(&node_key)?;
            match &loaded.node {
                JmtNode::Leaf(leaf) => {
                    if leaf.key_hash != key_hash {
                        return Ok(None);
                    }
                    return self.store.get_value_at(&key_hash, version);
                }
                JmtNode::Internal(node) => {
                    let nibble = nibble_at(&key_hash, depth);
                    let Some(child) = node.child(nibble) else {
                        return Ok(None);
                    };
                    node_key = NodeKey::new(node_key.path().child(nibble), child.version);
                    depth += 1;
                }
            }
        }
    }

    /// Value of `key` at the latest version
    pub fn get_latest(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.get(key, u64::MAX)
    }

    /// Collect the path for `key` in the tree visible at `version`.
    ///
    /// The proof shows inclusion if the key is present, otherwise exclusion
    /// through the empty slot or the other leaf found on the key's path.
    pub fn prove(&self, key: &[u8], version: u64) -> Result<Option<TrieProof>> {
        let Some((root_version, root_hash)) = self.store.floor(version)? else {
            return Ok(None);
        };
        let key_hash = self.hasher.digest(key);
        let mut proof = TrieProof {
            version: root_version,
            root_hash,
            key_hash,
            kind: ProofKind::ExclusionEmpty,
            steps: Vec::new(),
            leaf: None,
            value: None,
        };
        if root_hash == self.empty_root() {
            return Ok(Some(proof));
        }

        let mut node_key = NodeKey::root(root_version);
        let mut depth = 0;
        loop {
            let loaded = self.load_required(&node_key)?;
            match &loaded.node {
                JmtNode::Leaf(leaf) => {
                    proof.leaf = Some(*leaf);
                    if leaf.key_hash == key_hash {
                        proof.kind = ProofKind::Inclusion;
                        proof.value = self.store.get_value_at(&key_hash, version)?;
                    } else {
                        proof.kind = ProofKind::ExclusionLeaf;
                    }
                    return Ok(Some(proof));
                }
                JmtNode::Internal(node) => {
                    proof.steps.push(node.child_hashes());
                    let nibble = nibble_at(&key_hash, depth);
                    let Some(child) = node.child(nibble) else {
                        return Ok(Some(proof));
                    };
                    node_key = NodeKey::new(node_key.path().child(nibble), child.version);
                    depth += 1;
                }
            }
        }
    }

    // === Internal helpers ===

    fn load(&self, key: &NodeKey) -> Result<Option<Arc<LoadedNode>>> {
        if let Some(node) = self.cache.get(key) {
            return Ok(Some(node));
        }
        let Some(stored) = self.store.get_node(key)? else {
            return Ok(None);
        };
        let loaded = Arc::new(LoadedNode {
            node: stored.decode()?,
            hash: stored.hash,
        });
        self.cache.insert(key.clone(), loaded.clone());
        Ok(Some(loaded))
    }

    /// A node referenced by a committed parent or root must exist
    fn load_required(&self, key: &NodeKey) -> Result<Arc<LoadedNode>> {
        self.load(key)?
            .ok_or_else(|| Error::Corruption(format!("missing node {}", key)))
    }

    fn apply_at(
        &self,
        pass: &mut Pass<'_>,
        prefix: &NibblePath,
        existing: Option<(NodeKey, Arc<LoadedNode>)>,
        mut ops: Vec<Op>,
    ) -> Result<Subtree> {
        let Some((key, loaded)) = existing else {
            return self.build(pass, prefix, puts_only(ops));
        };
        match &loaded.node {
            JmtNode::Leaf(leaf) => {
                match ops.binary_search_by(|op| op.key_hash().cmp(&leaf.key_hash)) {
                    Ok(i) => {
                        // the existing leaf is rewritten or removed
                        if matches!(ops[i], Op::Delete(_)) {
                            pass.batch.delete_value(leaf.key_hash);
                            pass.values_deleted += 1;
                        }
                        pass.stale(key)?;
                    }
                    Err(i) => ops.insert(
                        i,
                        Op::Put(LeafEntry {
                            leaf: *leaf,
                            origin: Some(key),
                        }),
                    ),
                }
                self.build(pass, prefix, puts_only(ops))
            }
            JmtNode::Internal(node) => self.update_internal(pass, prefix, key, &loaded, node, ops),
        }
    }

    /// Lay out `entries` (sorted, distinct) below an empty position
    fn build(
        &self,
        pass: &mut Pass<'_>,
        prefix: &NibblePath,
        mut entries: Vec<LeafEntry>,
    ) -> Result<Subtree> {
        if entries.len() <= 1 {
            return Ok(entries.pop().map_or(Subtree::Empty, Subtree::Leaf));
        }
        let depth = prefix.len();
        if depth >= MAX_NIBBLES {
            return Err(Error::Corruption("distinct leaves share a full key hash".into()));
        }
        let mut node = InternalNode::new();
        for (nibble, group) in split_by_nibble(entries, depth, |e| &e.leaf.key_hash) {
            let child_prefix = prefix.child(nibble);
            let child = match self.build(pass, &child_prefix, group)? {
                Subtree::Empty => continue,
                Subtree::Leaf(entry) => pass.place_leaf(entry, &child_prefix, true)?,
                Subtree::Internal(child) => child,
            };
            node.set_child(nibble, Some(child));
        }
        pass.write_internal(prefix, node).map(Subtree::Internal)
    }

    fn update_internal(
        &self,
        pass: &mut Pass<'_>,
        prefix: &NibblePath,
        key: NodeKey,
        loaded: &LoadedNode,
        node: &InternalNode,
        ops: Vec<Op>,
    ) -> Result<Subtree> {
        let depth = prefix.len();
        let mut updated: [Option<Subtree>; 16] = Default::default();
        for (nibble, group) in split_by_nibble(ops, depth, Op::key_hash) {
            let child_prefix = prefix.child(nibble);
            let existing = match node.child(nibble) {
                Some(child) => {
                    let child_key = NodeKey::new(child_prefix.clone(), child.version);
                    let child_node = self.load_required(&child_key)?;
                    Some((child_key, child_node))
                }
                None => None,
            };
            updated[nibble as usize] = Some(self.apply_at(pass, &child_prefix, existing, group)?);
        }

        let present: Vec<u8> = (0..16u8)
            .filter(|&n| match &updated[n as usize] {
                Some(Subtree::Empty) => false,
                Some(_) => true,
                None => node.child(n).is_some(),
            })
            .collect();

        match present.as_slice() {
            [] => {
                pass.stale(key)?;
                return Ok(Subtree::Empty);
            }
            &[only] => {
                // a lone leaf moves up to the parent
                match updated[only as usize].take() {
                    Some(Subtree::Leaf(entry)) => {
                        pass.stale(key)?;
                        return Ok(Subtree::Leaf(entry));
                    }
                    None => {
                        if let Some(child) = node.child(only).filter(|c| c.kind == NodeKind::Leaf) {
                            let leaf_key = NodeKey::new(prefix.child(only), child.version);
                            let loaded_leaf = self.load_required(&leaf_key)?;
                            let JmtNode::Leaf(leaf) = &loaded_leaf.node else {
                                return Err(Error::Corruption(format!(
                                    "node {} is referenced as a leaf",
                                    leaf_key
                                )));
                            };
                            pass.stale(key)?;
                            return Ok(Subtree::Leaf(LeafEntry {
                                leaf: *leaf,
                                origin: Some(leaf_key),
                            }));
                        }
                    }
                    other => updated[only as usize] = other,
                }
            }
            _ => {}
        }

        let mut next = node.clone();
        for nibble in 0..16u8 {
            let Some(subtree) = updated[nibble as usize].take() else {
                continue;
            };
            let child = match subtree {
                Subtree::Empty => None,
                Subtree::Leaf(entry) => Some(pass.place_leaf(entry, &prefix.child(nibble), true)?),
                Subtree::Internal(child) => Some(child),
            };
            next.set_child(nibble, child);
        }

        if next == *node {
            return Ok(Subtree::Internal(Child {
                hash: loaded.hash,
                version: key.version(),
                kind: NodeKind::Internal,
            }));
        }
        pass.stale(key)?;
        pass.write_internal(prefix, next).map(Subtree::Internal)
    }

    /// Every committed version has its root node at `(root, version)`
    fn finish_root(&self, pass: &mut Pass<'_>, subtree: Subtree) -> Result<Hash> {
        let root = NibblePath::empty();
        match subtree {
            Subtree::Empty => Ok(self.empty_root()),
            Subtree::Leaf(entry) => pass.place_leaf(entry, &root, false).map(|c| c.hash),
            Subtree::Internal(child) if child.version == pass.version => Ok(child.hash),
            Subtree::Internal(child) => {
                let old = NodeKey::root(child.version);
                let loaded = self.load_required(&old)?;
                pass.stale(old)?;
                pass.batch.put_node(
                    NodeKey::root(pass.version),
                    StoredNode::new(child.hash, loaded.node.encode()),
                )?;
                Ok(child.hash)
            }
        }
    }
}
