//! The versioned trie engine

mod cache;
mod tree;

pub use cache::{CacheStats, LoadedNode, NodeCache};
pub use tree::{CommitOutcome, VersionedTrie};
