//! Commitment schemes: how node content maps to the digest stored in parents
//!
//! The engine, the proof codec and the node model all go through
//! [`CommitmentScheme`], so the same tree layout and wire format can be
//! re-targeted at another primitive by swapping the scheme.

use crate::model::{Hash, HashFunction};
use std::sync::Arc;

/// Domain byte prepended to leaf preimages
pub const LEAF_DOMAIN: u8 = 0x00;

/// Domain byte prepended to branch preimages
pub const BRANCH_DOMAIN: u8 = 0x01;

const NULL_PREIMAGE: &[u8] = b"vtrie.null";

pub trait CommitmentScheme: Send + Sync {
    /// Digest standing for an absent child or an empty tree. Never all-zero.
    fn null_hash(&self) -> Hash;

    fn commit_leaf(&self, key_hash: &Hash, value_hash: &Hash) -> Hash;

    /// Commit to the 16 ordered child slots of a branch
    fn commit_branch(&self, children: &[Option<Hash>; 16]) -> Hash;
}

/// Domain-separated commitment over an injected hash function:
///
/// * leaf: `H(0x00 || key_hash || value_hash)`
/// * branch: `H(0x01 || c_0 || ... || c_15)`, absent children as `null_hash`
/// * null: `H("vtrie.null")`
#[derive(Clone)]
pub struct ClassicCommitment {
    hasher: Arc<dyn HashFunction>,
    null: Hash,
}

impl ClassicCommitment {
    pub fn new(hasher: Arc<dyn HashFunction>) -> Self {
        let mut null = hasher.digest(NULL_PREIMAGE);
        if null.is_zero() {
            // keep the sentinel distinguishable from a zeroed buffer even for stub hashes
            null = hasher.digest_parts(&[NULL_PREIMAGE, NULL_PREIMAGE]);
        }
        ClassicCommitment { hasher, null }
    }

    pub fn hasher(&self) -> &Arc<dyn HashFunction> {
        &self.hasher
    }
}

impl CommitmentScheme for ClassicCommitment {
    fn null_hash(&self) -> Hash {
        self.null
    }

    fn commit_leaf(&self, key_hash: &Hash, value_hash: &Hash) -> Hash {
        self.hasher
            .digest_parts(&[&[LEAF_DOMAIN], key_hash.as_bytes(), value_hash.as_bytes()])
    }

    fn commit_branch(&self, children: &[Option<Hash>; 16]) -> Hash {
        let mut preimage = Vec::with_capacity(1 + 16 * Hash::LEN);
        preimage.push(BRANCH_DOMAIN);
        for child in children {
            preimage.extend_from_slice(child.as_ref().unwrap_or(&self.null).as_bytes());
        }
        self.hasher.digest(&preimage)
    }
}
