//! Node storage and the commit protocol
//!
//! Layers, bottom up:
//! - [`KvBackend`]: sorted byte map with atomic batches (memory, log file, SQLite)
//! - [`KvNodeStore`]: trie records laid out in one namespace of a backend
//! - [`CommitBatch`]: the only way to write, one version at a time

pub mod backend;
pub mod batch;
pub mod file_store;
pub mod keys;
pub mod memory;
pub mod node_store;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use backend::{Durability, KvBackend, WriteBatch, WriteOp};
pub use batch::{BatchSink, BatchState, CommitBatch, StagedCommit};
pub use file_store::{CompactionStats, FileStore};
pub use memory::MemoryBackend;
pub use node_store::{KvNodeStore, StoreStats};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

use crate::model::{Hash, JmtNode, NodeKey};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Options recognised by [`NodeStore::begin_commit`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitConfig {
    #[serde(default)]
    pub durability: Durability,
    /// Expected number of staged records; sizes buffers
    #[serde(default = "default_batch_size_hint")]
    pub batch_size_hint: usize,
}

fn default_batch_size_hint() -> usize {
    256
}

impl Default for CommitConfig {
    fn default() -> Self {
        CommitConfig {
            durability: Durability::default(),
            batch_size_hint: default_batch_size_hint(),
        }
    }
}

/// A node as persisted: its commitment and canonical bytes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredNode {
    pub hash: Hash,
    pub bytes: Vec<u8>,
}

impl StoredNode {
    pub fn new(hash: Hash, bytes: Vec<u8>) -> Self {
        StoredNode { hash, bytes }
    }

    pub fn decode(&self) -> Result<JmtNode> {
        JmtNode::decode(&self.bytes)
    }

    /// `hash || bytes`
    pub(crate) fn to_record(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Hash::LEN + self.bytes.len());
        out.extend_from_slice(self.hash.as_bytes());
        out.extend_from_slice(&self.bytes);
        out
    }

    pub(crate) fn from_record(record: &[u8]) -> Result<Self> {
        if record.len() < Hash::LEN {
            return Err(Error::Corruption(format!("node record of {} bytes", record.len())));
        }
        let (hash, bytes) = record.split_at(Hash::LEN);
        let hash = Hash::from_slice(hash)
            .ok_or_else(|| Error::Corruption("node record hash".into()))?;
        Ok(StoredNode::new(hash, bytes.to_vec()))
    }
}

/// A superseded node awaiting collection
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StaleNode {
    pub stale_since: u64,
    pub node_key: NodeKey,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RemovalStats {
    pub removed: u64,
    pub bytes: u64,
}

/// Append-only `version -> root hash` log
pub trait RootsIndex: Send + Sync {
    /// Record a root. Fails with `VersionConflict` unless `version` is above
    /// every recorded version.
    fn put(&self, version: u64, root: Hash) -> Result<()>;

    fn get(&self, version: u64) -> Result<Option<Hash>>;

    fn latest(&self) -> Result<Option<(u64, Hash)>>;

    fn latest_version(&self) -> Result<Option<u64>> {
        Ok(self.latest()?.map(|(v, _)| v))
    }

    /// Greatest recorded version `<= version`
    fn floor(&self, version: u64) -> Result<Option<(u64, Hash)>>;

    /// Every recorded root, read in one pass
    fn snapshot(&self) -> Result<BTreeMap<u64, Hash>>;
}

/// Persistence contract consumed by the trie engine and the collector
pub trait NodeStore: Send + Sync {
    /// Reserve `version` and open a batch for it
    fn begin_commit(&self, version: u64, config: &CommitConfig) -> Result<CommitBatch<'_>>;

    fn get_node(&self, key: &NodeKey) -> Result<Option<StoredNode>>;

    /// Value visible at `version`, honouring tombstones
    fn get_value_at(&self, key_hash: &Hash, version: u64) -> Result<Option<Vec<u8>>>;

    /// Any stored node with commitment `hash`
    fn find_node_by_hash(&self, hash: &Hash) -> Result<Option<(NodeKey, StoredNode)>>;

    /// Up to `limit` stale markers with `stale_since < before`, ordered by
    /// `(stale_since, node_key)`, starting after `after`
    fn stale_nodes(
        &self,
        before: u64,
        after: Option<&StaleNode>,
        limit: usize,
    ) -> Result<Vec<StaleNode>>;

    /// Delete the nodes and their stale markers in one atomic write
    fn remove_stale(&self, nodes: &[StaleNode], durability: Durability) -> Result<RemovalStats>;

    fn namespace(&self) -> &str;
}
