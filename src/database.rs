//! High-level state database API
//!
//! [`StateDb`] wires a backend, a namespace, the trie engine, proofs and
//! garbage collection together from one [`TrieConfig`].

use crate::config::TrieConfig;
use crate::gc::{GcOptions, GcReport, GcStrategyKind, RetentionPolicy};
use crate::model::Hash;
use crate::proof::{self, ProofKind};
#[cfg(feature = "sqlite")]
use crate::store::SqliteBackend;
use crate::store::{
    CompactionStats, FileStore, KvBackend, KvNodeStore, MemoryBackend, RootsIndex, StoreStats,
};
use crate::trie::{CacheStats, CommitOutcome, VersionedTrie};
use crate::Result;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Where the database lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backend {
    Memory,
    /// Log-structured single file
    File(PathBuf),
    #[cfg(feature = "sqlite")]
    Sqlite(PathBuf),
}

/// A proof ready to hand to a verifier
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProofBundle {
    pub version: u64,
    pub root_hash: Hash,
    pub kind: ProofKind,
    /// Value of the key at the requested version, if included
    pub value: Option<Vec<u8>>,
    pub wire: Vec<u8>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DbStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub latest_root: String,
    pub cache: CacheStats,
    /// Log size for file backends
    pub file_bytes: Option<u64>,
}

/// The main database interface
///
/// Every write commits a new version. Versions are chosen by the caller and
/// must increase; passing `None` uses the latest version plus one.
pub struct StateDb {
    config: TrieConfig,
    trie: VersionedTrie,
    file: Option<Arc<FileStore>>,
}

impl StateDb {
    /// Open (or create) the database behind `backend`
    pub fn open(backend: Backend, config: TrieConfig) -> Result<Self> {
        config.validate()?;
        let mut file = None;
        let kv: Arc<dyn KvBackend> = match &backend {
            Backend::Memory => Arc::new(MemoryBackend::new()),
            Backend::File(path) => {
                let store = Arc::new(FileStore::open_or_create(path)?);
                file = Some(store.clone());
                store
            }
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(path) => Arc::new(SqliteBackend::open(path, &config.sqlite_table_prefix)?),
        };
        let store = KvNodeStore::new(kv, &config.namespace)?;
        let trie = VersionedTrie::new(Arc::new(store), config.hash.hasher())
            .with_commit_config(config.commit_config())
            .with_cache_capacity(config.node_cache_capacity);
        info!(
            backend = ?backend,
            namespace = %config.namespace,
            hash = trie.hasher().name(),
            "opened state database"
        );
        Ok(StateDb { config, trie, file })
    }

    pub fn in_memory(config: TrieConfig) -> Result<Self> {
        Self::open(Backend::Memory, config)
    }

    pub fn config(&self) -> &TrieConfig {
        &self.config
    }

    pub fn trie(&self) -> &VersionedTrie {
        &self.trie
    }

    fn resolve_write(&self, version: Option<u64>) -> Result<u64> {
        match version {
            Some(v) => Ok(v),
            None => self.trie.next_version(),
        }
    }

    fn resolve_read(version: Option<u64>) -> u64 {
        version.unwrap_or(u64::MAX)
    }

    // === Writes ===

    pub fn insert(&self, key: &[u8], value: &[u8], version: Option<u64>) -> Result<CommitOutcome> {
        self.apply(version, [(key, Some(value))])
    }

    pub fn delete(&self, key: &[u8], version: Option<u64>) -> Result<CommitOutcome> {
        self.apply(version, [(key, None::<&[u8]>)])
    }

    /// Commit many puts and deletes as one version
    pub fn apply<I, K, V>(&self, version: Option<u64>, updates: I) -> Result<CommitOutcome>
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let version = self.resolve_write(version)?;
        self.trie.apply(version, updates)
    }

    // === Reads ===

    /// Value of `key` at `version` (latest if `None`)
    pub fn get(&self, key: &[u8], version: Option<u64>) -> Result<Option<Vec<u8>>> {
        self.trie.get(key, Self::resolve_read(version))
    }

    /// Root hash at `version` (latest if `None`); `None` before the first commit
    pub fn root_hash(&self, version: Option<u64>) -> Result<Option<Hash>> {
        self.trie.root_hash(Self::resolve_read(version))
    }

    pub fn latest_version(&self) -> Result<Option<u64>> {
        self.trie.latest_version()
    }

    /// Every committed version with its root, oldest first
    pub fn versions(&self) -> Result<Vec<(u64, Hash)>> {
        Ok(self.trie.store().snapshot()?.into_iter().collect())
    }

    // === Proofs ===

    /// Inclusion or exclusion proof for `key` at `version` (latest if `None`)
    pub fn prove(&self, key: &[u8], version: Option<u64>) -> Result<Option<ProofBundle>> {
        let Some(proof) = self.trie.prove(key, Self::resolve_read(version))? else {
            return Ok(None);
        };
        let wire = proof::to_wire(
            &proof,
            key,
            self.trie.hasher().as_ref(),
            self.trie.commitment().as_ref(),
        )?;
        Ok(Some(ProofBundle {
            version: proof.version,
            root_hash: proof.root_hash,
            kind: proof.kind,
            value: proof.value,
            wire,
        }))
    }

    /// Check a wire proof with this database's hash and commitment scheme
    pub fn verify(
        &self,
        root: &Hash,
        key: &[u8],
        value: Option<&[u8]>,
        including: bool,
        wire: &[u8],
    ) -> bool {
        proof::verify(
            root,
            key,
            value,
            including,
            wire,
            self.trie.hasher().as_ref(),
            self.trie.commitment().as_ref(),
        )
    }

    // === Maintenance ===

    /// Collect garbage with the configured strategy and retention
    pub fn gc(&self) -> Result<GcReport> {
        self.gc_with(self.config.gc.strategy, &self.config.gc.retention, &self.config.gc_options())
    }

    pub fn gc_with(
        &self,
        strategy: GcStrategyKind,
        policy: &RetentionPolicy,
        options: &GcOptions,
    ) -> Result<GcReport> {
        let store = self.trie.store().as_ref();
        let result = strategy.strategy().run(store, store, policy, options);
        // cached nodes may have been deleted
        self.trie.clear_cache();
        result
    }

    /// Rewrite the log file without superseded frames; `None` for other backends
    pub fn compact(&self) -> Result<Option<CompactionStats>> {
        self.file.as_ref().map(|file| file.compact()).transpose()
    }

    pub fn stats(&self) -> Result<DbStats> {
        Ok(DbStats {
            store: self.trie.store().stats()?,
            latest_root: self.trie.latest_root_hash()?.to_hex(),
            cache: self.trie.cache_stats(),
            file_bytes: self.file.as_ref().map(|f| f.log_size()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_auto_versions() {
        let db = StateDb::in_memory(TrieConfig::default()).unwrap();
        assert_eq!(db.insert(b"a", b"1", None).unwrap().version, 1);
        assert_eq!(db.insert(b"b", b"2", Some(10)).unwrap().version, 10);
        assert_eq!(db.delete(b"a", None).unwrap().version, 11);
        let versions: Vec<u64> = db.versions().unwrap().into_iter().map(|(v, _)| v).collect();
        assert_eq!(versions, vec![1, 10, 11]);
        assert_eq!(db.get(b"a", Some(9)).unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(b"a", None).unwrap(), None);
    }

    #[test]
    fn test_prove_and_verify() {
        let db = StateDb::in_memory(TrieConfig::default()).unwrap();
        db.apply(None, [("x", Some("1")), ("y", Some("2")), ("z", Some("3"))])
            .unwrap();
        let root = db.root_hash(None).unwrap().unwrap();

        let bundle = db.prove(b"y", None).unwrap().unwrap();
        assert_eq!(bundle.kind, ProofKind::Inclusion);
        assert_eq!(bundle.value.as_deref(), Some(b"2".as_slice()));
        assert!(db.verify(&root, b"y", Some(b"2".as_slice()), true, &bundle.wire));

        let absent = db.prove(b"w", None).unwrap().unwrap();
        assert!(db.verify(&root, b"w", None, false, &absent.wire));
        assert!(!db.verify(&root, b"w", None, true, &absent.wire));
    }

    #[test]
    fn test_file_backend_reopen_and_compact() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.vtrie");
        let root = {
            let db = StateDb::open(Backend::File(path.clone()), TrieConfig::default()).unwrap();
            for v in 1..=5u64 {
                db.insert(b"counter", v.to_string().as_bytes(), Some(v)).unwrap();
            }
            let report = db
                .gc_with(
                    GcStrategyKind::Incremental,
                    &RetentionPolicy::KeepLatest(1),
                    &GcOptions::default(),
                )
                .unwrap();
            assert!(report.nodes_removed > 0);
            let stats = db.compact().unwrap().unwrap();
            assert!(stats.bytes_after < stats.bytes_before);
            db.root_hash(None).unwrap().unwrap()
        };

        let db = StateDb::open(Backend::File(path), TrieConfig::default()).unwrap();
        assert_eq!(db.root_hash(None).unwrap(), Some(root));
        assert_eq!(db.get(b"counter", None).unwrap(), Some(b"5".to_vec()));
        assert_eq!(db.latest_version().unwrap(), Some(5));
    }

    #[test]
    fn test_stats_and_memory_compact() {
        let db = StateDb::in_memory(TrieConfig::default()).unwrap();
        db.insert(b"k", b"v", None).unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.store.roots, 1);
        assert_eq!(stats.store.latest_version, Some(1));
        assert!(stats.file_bytes.is_none());
        assert!(db.compact().unwrap().is_none());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrieConfig {
            namespace: String::new(),
            ..TrieConfig::default()
        };
        assert!(StateDb::in_memory(config).is_err());
    }
}
