//! Core data model types for vtrie

pub mod encoding;
pub mod hash;
pub mod nibble;
pub mod node;
pub mod node_key;

pub use hash::{Blake2b256Hasher, Blake3Hasher, Hash, HashAlgorithm, HashFunction};
pub use nibble::{nibble_at, NibblePath};
pub use node::{Child, InternalNode, JmtNode, LeafNode, NodeKind};
pub use node_key::NodeKey;
