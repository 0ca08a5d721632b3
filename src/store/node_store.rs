//! Trie records on top of any [`KvBackend`]

use crate::model::{Hash, NodeKey};
use crate::store::backend::{Durability, KvBackend, WriteBatch};
use crate::store::batch::{BatchSink, CommitBatch, StagedCommit};
use crate::store::keys::Keyspace;
use crate::store::{CommitConfig, NodeStore, RemovalStats, RootsIndex, StaleNode, StoredNode};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

const TOMBSTONE: u8 = 0;
const LIVE: u8 = 1;

/// Record counts of one namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub backend: String,
    pub namespace: String,
    pub nodes: usize,
    pub stale_markers: usize,
    pub value_records: usize,
    pub roots: usize,
    pub latest_version: Option<u64>,
}

/// Node store, roots index and value history laid out in one namespace of a
/// shared backend.
pub struct KvNodeStore {
    backend: Arc<dyn KvBackend>,
    keys: Keyspace,
    /// Serialises the version check with the write that depends on it
    commit_lock: Mutex<()>,
    in_flight: Mutex<BTreeSet<u64>>,
}

impl KvNodeStore {
    pub fn new(backend: Arc<dyn KvBackend>, namespace: &str) -> Result<Self> {
        let keys = Keyspace::new(namespace)?;
        debug!(backend = backend.name(), namespace, "opened node store");
        Ok(KvNodeStore {
            backend,
            keys,
            commit_lock: Mutex::new(()),
            in_flight: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    fn ensure_above_latest(&self, version: u64) -> Result<()> {
        let latest = self.latest_version()?;
        match latest {
            Some(l) if version <= l => Err(Error::VersionConflict { version, latest }),
            _ => Ok(()),
        }
    }

    fn parse_root_entry(&self, key: &[u8], value: &[u8]) -> Result<(u64, Hash)> {
        let version = self.keys.parse_root(key)?;
        let hash = Hash::from_slice(value)
            .ok_or_else(|| Error::Corruption(format!("root hash at version {}", version)))?;
        Ok((version, hash))
    }

    fn count_section(&self, (start, end): (Vec<u8>, Vec<u8>)) -> Result<usize> {
        Ok(self.backend.scan_range(&start, &end, usize::MAX)?.len())
    }

    /// Count records of every kind. Walks the whole namespace.
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            backend: self.backend.name().to_string(),
            namespace: self.keys.namespace().to_string(),
            nodes: self.count_section(self.keys.nodes())?,
            stale_markers: self.count_section(self.keys.stale_markers())?,
            value_records: self.count_section(self.keys.values())?,
            roots: self.count_section(self.keys.roots())?,
            latest_version: self.latest_version()?,
        })
    }
}

impl RootsIndex for KvNodeStore {
    fn put(&self, version: u64, root: Hash) -> Result<()> {
        let _guard = self.commit_lock.lock();
        self.ensure_above_latest(version)?;
        self.backend.put(&self.keys.root(version), root.as_bytes())
    }

    fn get(&self, version: u64) -> Result<Option<Hash>> {
        match self.backend.get(&self.keys.root(version))? {
            Some(bytes) => {
                let hash = Hash::from_slice(&bytes)
                    .ok_or_else(|| Error::Corruption(format!("root hash at version {}", version)))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    fn latest(&self) -> Result<Option<(u64, Hash)>> {
        let (start, end) = self.keys.roots();
        self.backend
            .last_in_range(&start, &end)?
            .map(|(k, v)| self.parse_root_entry(&k, &v))
            .transpose()
    }

    fn floor(&self, version: u64) -> Result<Option<(u64, Hash)>> {
        let (start, end) = self.keys.roots_through(version);
        self.backend
            .last_in_range(&start, &end)?
            .map(|(k, v)| self.parse_root_entry(&k, &v))
            .transpose()
    }

    fn snapshot(&self) -> Result<BTreeMap<u64, Hash>> {
        let (start, end) = self.keys.roots();
        self.backend
            .scan_range(&start, &end, usize::MAX)?
            .iter()
            .map(|(k, v)| self.parse_root_entry(k, v))
            .collect()
    }
}

impl BatchSink for KvNodeStore {
    fn read_node(&self, key: &NodeKey) -> Result<Option<StoredNode>> {
        self.get_node(key)
    }

    fn read_value(&self, key_hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.get_value_at(key_hash, u64::MAX)
    }

    fn apply_commit(&self, staged: StagedCommit, config: &CommitConfig) -> Result<()> {
        let version = staged.version;
        let root = staged.root_hash.ok_or(Error::MissingRootHash(version))?;

        let mut batch = WriteBatch::with_capacity(
            config
                .batch_size_hint
                .max(staged.nodes.len() * 2 + staged.values.len() + staged.stale.len() + 1),
        );
        for (key, node) in &staged.nodes {
            batch.put(self.keys.node(key), node.to_record());
            batch.put(self.keys.hash_index(&node.hash, key), Vec::new());
        }
        for (key_hash, value) in &staged.values {
            let record = match value {
                Some(bytes) => {
                    let mut record = Vec::with_capacity(1 + bytes.len());
                    record.push(LIVE);
                    record.extend_from_slice(bytes);
                    record
                }
                None => vec![TOMBSTONE],
            };
            batch.put(self.keys.value(key_hash, version), record);
        }
        for key in &staged.stale {
            batch.put(self.keys.stale(version, key), Vec::new());
        }
        batch.put(self.keys.root(version), root.as_bytes().to_vec());

        let _guard = self.commit_lock.lock();
        self.ensure_above_latest(version)?;
        let ops = batch.len();
        self.backend.write(batch, config.durability)?;
        info!(
            namespace = self.keys.namespace(),
            version,
            root = %root.short(),
            nodes = staged.nodes.len(),
            stale = staged.stale.len(),
            values = staged.values.len(),
            ops,
            "committed version"
        );
        Ok(())
    }

    fn release(&self, version: u64) {
        self.in_flight.lock().remove(&version);
    }
}

impl NodeStore for KvNodeStore {
    fn begin_commit(&self, version: u64, config: &CommitConfig) -> Result<CommitBatch<'_>> {
        self.ensure_above_latest(version)?;
        if !self.in_flight.lock().insert(version) {
            return Err(Error::VersionInFlight(version));
        }
        Ok(CommitBatch::new(self, version, config.clone()))
    }

    fn get_node(&self, key: &NodeKey) -> Result<Option<StoredNode>> {
        self.backend
            .get(&self.keys.node(key))?
            .map(|record| StoredNode::from_record(&record))
            .transpose()
    }

    fn get_value_at(&self, key_hash: &Hash, version: u64) -> Result<Option<Vec<u8>>> {
        let (start, end) = self.keys.value_history(key_hash, version);
        let Some((_, record)) = self.backend.last_in_range(&start, &end)? else {
            return Ok(None);
        };
        match record.split_first() {
            Some((&TOMBSTONE, [])) => Ok(None),
            Some((&LIVE, value)) => Ok(Some(value.to_vec())),
            _ => Err(Error::Corruption(format!("value record for {}", key_hash))),
        }
    }

    fn find_node_by_hash(&self, hash: &Hash) -> Result<Option<(NodeKey, StoredNode)>> {
        let (start, end) = self.keys.hash_index_range(hash);
        for (index_key, _) in self.backend.scan_range(&start, &end, 4)? {
            let node_key = self.keys.parse_hash_index(&index_key)?;
            if let Some(node) = self.get_node(&node_key)? {
                return Ok(Some((node_key, node)));
            }
        }
        Ok(None)
    }

    fn stale_nodes(
        &self,
        before: u64,
        after: Option<&StaleNode>,
        limit: usize,
    ) -> Result<Vec<StaleNode>> {
        let (mut start, end) = self.keys.stale_before(before);
        if let Some(after) = after {
            start = self.keys.stale(after.stale_since, &after.node_key);
            start.push(0);
        }
        self.backend
            .scan_range(&start, &end, limit)?
            .iter()
            .map(|(k, _)| {
                let (stale_since, node_key) = self.keys.parse_stale(k)?;
                Ok(StaleNode {
                    stale_since,
                    node_key,
                })
            })
            .collect()
    }

    fn remove_stale(&self, nodes: &[StaleNode], durability: Durability) -> Result<RemovalStats> {
        let mut stats = RemovalStats::default();
        let mut batch = WriteBatch::with_capacity(nodes.len() * 3);
        for stale in nodes {
            let node_key = self.keys.node(&stale.node_key);
            if let Some(record) = self.backend.get(&node_key)? {
                let node = StoredNode::from_record(&record)?;
                let index_key = self.keys.hash_index(&node.hash, &stale.node_key);
                stats.removed += 1;
                stats.bytes += (node_key.len() + record.len() + index_key.len()) as u64;
                batch.delete(node_key);
                batch.delete(index_key);
            }
            batch.delete(self.keys.stale(stale.stale_since, &stale.node_key));
        }
        self.backend.write(batch, durability)?;
        Ok(stats)
    }

    fn namespace(&self) -> &str {
        self.keys.namespace()
    }
}
