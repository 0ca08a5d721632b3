//! Scoped write transaction bound to one target version

use crate::model::{Hash, NodeKey};
use crate::store::{CommitConfig, StoredNode};
use crate::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Everything a batch accumulated, handed to the store on commit
#[derive(Clone, Debug, Default)]
pub struct StagedCommit {
    pub version: u64,
    pub nodes: BTreeMap<NodeKey, StoredNode>,
    /// `None` is a tombstone
    pub values: BTreeMap<Hash, Option<Vec<u8>>>,
    pub stale: BTreeSet<NodeKey>,
    pub root_hash: Option<Hash>,
}

/// Store-side half of the commit protocol
pub trait BatchSink: Send + Sync {
    /// Committed node, ignoring anything staged
    fn read_node(&self, key: &NodeKey) -> Result<Option<StoredNode>>;

    /// Committed value as of the latest version
    fn read_value(&self, key_hash: &Hash) -> Result<Option<Vec<u8>>>;

    /// Make `staged` durable and visible atomically, or fail with nothing applied
    fn apply_commit(&self, staged: StagedCommit, config: &CommitConfig) -> Result<()>;

    /// The batch for `version` is finished, committed or not
    fn release(&self, version: u64);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    Open,
    Committed,
    Abandoned,
}

/// Staged writes for one version.
///
/// Reads through the batch see its own staged writes; nobody else does until
/// [`commit`](Self::commit) succeeds. Dropping a batch without committing
/// abandons it, as does a failed commit.
pub struct CommitBatch<'a> {
    sink: &'a dyn BatchSink,
    config: CommitConfig,
    staged: StagedCommit,
    state: BatchState,
}

impl<'a> CommitBatch<'a> {
    /// Open a batch. Stores call this from `begin_commit` after reserving
    /// `version`; the batch releases the reservation when it ends.
    pub fn new(sink: &'a dyn BatchSink, version: u64, config: CommitConfig) -> Self {
        CommitBatch {
            sink,
            config,
            staged: StagedCommit {
                version,
                ..StagedCommit::default()
            },
            state: BatchState::Open,
        }
    }

    pub fn version(&self) -> u64 {
        self.staged.version
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    /// Stage a node created at this batch's version
    pub fn put_node(&mut self, key: NodeKey, node: StoredNode) -> Result<()> {
        if key.version() != self.staged.version {
            return Err(Error::InvalidBatch(format!(
                "node {} written in batch for version {}",
                key,
                self.staged.version
            )));
        }
        if self.staged.nodes.contains_key(&key) {
            return Err(Error::InvalidBatch(format!("node {} written twice", key)));
        }
        self.staged.nodes.insert(key, node);
        Ok(())
    }

    pub fn put_value(&mut self, key_hash: Hash, value: Vec<u8>) {
        self.staged.values.insert(key_hash, Some(value));
    }

    /// Stage a tombstone
    pub fn delete_value(&mut self, key_hash: Hash) {
        self.staged.values.insert(key_hash, None);
    }

    /// Record that `key` is superseded as of this batch's version
    pub fn mark_stale(&mut self, key: NodeKey) -> Result<()> {
        if key.version() >= self.staged.version {
            return Err(Error::InvalidBatch(format!(
                "node {} cannot be stale at version {}",
                key,
                self.staged.version
            )));
        }
        self.staged.stale.insert(key);
        Ok(())
    }

    pub fn set_root_hash(&mut self, hash: Hash) {
        self.staged.root_hash = Some(hash);
    }

    pub fn root_hash(&self) -> Option<Hash> {
        self.staged.root_hash
    }

    /// Staged node if any, else the committed one
    pub fn get_node(&self, key: &NodeKey) -> Result<Option<StoredNode>> {
        match self.staged.nodes.get(key) {
            Some(node) => Ok(Some(node.clone())),
            None => self.sink.read_node(key),
        }
    }

    /// Staged value (or tombstone) if any, else the latest committed one
    pub fn get_value(&self, key_hash: &Hash) -> Result<Option<Vec<u8>>> {
        match self.staged.values.get(key_hash) {
            Some(staged) => Ok(staged.clone()),
            None => self.sink.read_value(key_hash),
        }
    }

    pub fn staged_nodes(&self) -> usize {
        self.staged.nodes.len()
    }

    pub fn staged_stale(&self) -> usize {
        self.staged.stale.len()
    }

    pub fn staged_values(&self) -> usize {
        self.staged.values.len()
    }

    /// Apply every staged write atomically
    pub fn commit(mut self) -> Result<()> {
        if self.staged.root_hash.is_none() {
            return Err(Error::MissingRootHash(self.staged.version));
        }
        let staged = std::mem::take(&mut self.staged);
        let version = staged.version;
        // restore the version so Drop releases the right reservation
        self.staged.version = version;
        self.sink.apply_commit(staged, &self.config)?;
        self.state = BatchState::Committed;
        Ok(())
    }

    /// Discard every staged write
    pub fn abandon(mut self) {
        self.state = BatchState::Abandoned;
    }
}

impl std::fmt::Debug for CommitBatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitBatch")
            .field("version", &self.staged.version)
            .field("state", &self.state)
            .field("nodes", &self.staged.nodes.len())
            .field("values", &self.staged.values.len())
            .field("stale", &self.staged.stale.len())
            .finish()
    }
}

impl Drop for CommitBatch<'_> {
    fn drop(&mut self) {
        if self.state == BatchState::Open {
            self.state = BatchState::Abandoned;
            debug!(
                version = self.staged.version,
                nodes = self.staged.nodes.len(),
                "commit batch dropped without commit"
            );
        }
        self.sink.release(self.staged.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::Durability;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        applied: Mutex<Vec<StagedCommit>>,
        released: Mutex<Vec<u64>>,
        fail: bool,
    }

    impl BatchSink for RecordingSink {
        fn read_node(&self, _key: &NodeKey) -> Result<Option<StoredNode>> {
            Ok(None)
        }

        fn read_value(&self, key_hash: &Hash) -> Result<Option<Vec<u8>>> {
            Ok(Some(key_hash.as_bytes().to_vec()))
        }

        fn apply_commit(&self, staged: StagedCommit, _config: &CommitConfig) -> Result<()> {
            if self.fail {
                return Err(Error::Io(std::io::Error::other("disk full")));
            }
            self.applied.lock().push(staged);
            Ok(())
        }

        fn release(&self, version: u64) {
            self.released.lock().push(version);
        }
    }

    fn config() -> CommitConfig {
        CommitConfig {
            durability: Durability::Buffered,
            batch_size_hint: 0,
        }
    }

    fn node() -> StoredNode {
        StoredNode::new(Hash::from_bytes([1; 32]), vec![1, 2, 3])
    }

    #[test]
    fn test_read_your_writes() {
        let sink = RecordingSink::default();
        let mut batch = CommitBatch::new(&sink, 4, config());
        let kh = Hash::from_bytes([5; 32]);

        assert_eq!(batch.get_value(&kh).unwrap(), Some(vec![5; 32]));
        batch.put_value(kh, b"staged".to_vec());
        assert_eq!(batch.get_value(&kh).unwrap(), Some(b"staged".to_vec()));
        batch.delete_value(kh);
        assert_eq!(batch.get_value(&kh).unwrap(), None);

        batch.put_node(NodeKey::root(4), node()).unwrap();
        assert_eq!(batch.get_node(&NodeKey::root(4)).unwrap(), Some(node()));
    }

    #[test]
    fn test_drop_abandons_and_releases() {
        let sink = RecordingSink::default();
        {
            let mut batch = CommitBatch::new(&sink, 2, config());
            batch.put_value(Hash::ZERO, vec![1]);
            batch.set_root_hash(Hash::ZERO);
        }
        assert!(sink.applied.lock().is_empty());
        assert_eq!(*sink.released.lock(), vec![2]);
    }

    #[test]
    fn test_commit_hands_over_everything() {
        let sink = RecordingSink::default();
        let mut batch = CommitBatch::new(&sink, 3, config());
        batch.put_node(NodeKey::root(3), node()).unwrap();
        batch.mark_stale(NodeKey::root(2)).unwrap();
        batch.put_value(Hash::ZERO, vec![9]);
        batch.set_root_hash(Hash::from_bytes([1; 32]));
        batch.commit().unwrap();

        let applied = sink.applied.lock();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].version, 3);
        assert_eq!(applied[0].nodes.len(), 1);
        assert_eq!(applied[0].stale.len(), 1);
        assert_eq!(*sink.released.lock(), vec![3]);
    }

    #[test]
    fn test_commit_requires_root() {
        let sink = RecordingSink::default();
        let batch = CommitBatch::new(&sink, 1, config());
        assert!(matches!(batch.commit(), Err(Error::MissingRootHash(1))));
        assert!(sink.applied.lock().is_empty());
        assert_eq!(*sink.released.lock(), vec![1]);
    }

    #[test]
    fn test_failed_commit_is_abandoned() {
        let sink = RecordingSink {
            fail: true,
            ..RecordingSink::default()
        };
        let mut batch = CommitBatch::new(&sink, 8, config());
        batch.set_root_hash(Hash::ZERO);
        assert!(batch.commit().is_err());
        assert_eq!(*sink.released.lock(), vec![8]);
    }

    #[test]
    fn test_version_rules() {
        let sink = RecordingSink::default();
        let mut batch = CommitBatch::new(&sink, 5, config());
        assert!(batch.put_node(NodeKey::root(4), node()).is_err());
        batch.put_node(NodeKey::root(5), node()).unwrap();
        assert!(batch.put_node(NodeKey::root(5), node()).is_err());
        assert!(batch.mark_stale(NodeKey::root(5)).is_err());
        batch.mark_stale(NodeKey::root(1)).unwrap();
        assert_eq!(batch.state(), BatchState::Open);
        batch.abandon();
    }
}
