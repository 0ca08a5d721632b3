//! Membership proofs against a historical root
//!
//! A [`TrieProof`] is collected by [`VersionedTrie::prove`](crate::trie::VersionedTrie::prove)
//! and serialized with [`to_wire`]. [`verify`] needs nothing but the wire
//! bytes, the claim and the hash/commitment pair the tree was built with.

mod codec;

pub use codec::{to_wire, verify, WIRE_VERSION};

use crate::model::{Hash, LeafNode};
use serde::Serialize;

/// What a proof demonstrates
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofKind {
    /// The key is present; the terminal leaf is the key's own leaf
    Inclusion,
    /// The key's path ends at a leaf for a different key
    ExclusionLeaf,
    /// The key's path ends at an empty slot, or the tree is empty
    ExclusionEmpty,
}

impl ProofKind {
    pub(crate) fn tag(self) -> u8 {
        match self {
            ProofKind::Inclusion => 0,
            ProofKind::ExclusionLeaf => 1,
            ProofKind::ExclusionEmpty => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(ProofKind::Inclusion),
            1 => Some(ProofKind::ExclusionLeaf),
            2 => Some(ProofKind::ExclusionEmpty),
            _ => None,
        }
    }

    pub fn is_inclusion(self) -> bool {
        self == ProofKind::Inclusion
    }
}

/// Path from a root to where a key lives or would live
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrieProof {
    /// Version of the root the path was read from
    pub version: u64,
    pub root_hash: Hash,
    pub key_hash: Hash,
    pub kind: ProofKind,
    /// Child commitments of each internal node on the path, root first
    pub steps: Vec<[Option<Hash>; 16]>,
    /// Terminal leaf, absent for [`ProofKind::ExclusionEmpty`]
    pub leaf: Option<LeafNode>,
    /// Value of an included key as of the requested version
    pub value: Option<Vec<u8>>,
}

impl TrieProof {
    pub fn depth(&self) -> usize {
        self.steps.len()
    }
}
