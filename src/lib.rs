//! # vtrie
//!
//! A versioned, Merkle-authenticated key-value store.
//!
//! Every commit produces an immutable tree addressed by a version number and
//! summarized by a 32-byte root hash. Old versions stay readable until the
//! garbage collector reclaims them, and any read can be backed by a compact
//! proof that a verifier checks against the root hash alone.
//!
//! ## Core Concepts
//!
//! - **Trie**: sparse 16-ary tree over key hashes, nodes addressed by `(path, version)`
//! - **Commit batch**: the atomic unit of writing one version
//! - **Stale markers**: which superseded nodes each version leaves behind
//! - **Proofs**: inclusion and exclusion certificates with a stable wire format
//!
//! ## Example
//!
//! ```ignore
//! use vtrie::{Backend, StateDb, TrieConfig};
//!
//! let db = StateDb::open(Backend::File("state.vtrie".into()), TrieConfig::default())?;
//! db.insert(b"alpha", b"1", Some(1))?;
//! let proof = db.prove(b"alpha", None)?.expect("committed");
//! assert!(db.verify(&proof.root_hash, b"alpha", Some(b"1"), true, &proof.wire));
//! ```

pub mod commitment;
pub mod config;
pub mod gc;
pub mod model;
pub mod proof;
pub mod store;
pub mod trie;

mod database;
mod error;

pub use commitment::{ClassicCommitment, CommitmentScheme};
pub use config::{GcConfig, TrieConfig};
pub use database::{Backend, DbStats, ProofBundle, StateDb};
pub use error::{Error, Result};
pub use gc::{GcOptions, GcReport, GcStrategy, GcStrategyKind, RetentionPolicy};
pub use model::{Hash, HashAlgorithm, HashFunction};
pub use proof::{ProofKind, TrieProof};
pub use store::{KvBackend, KvNodeStore, NodeStore, RootsIndex};
pub use trie::{CommitOutcome, VersionedTrie};

/// Magic bytes at the start of a log file
pub const MAGIC: &[u8; 8] = b"VTRIE_DB";

/// Current log file format version
pub const FORMAT_VERSION: u32 = 1;
