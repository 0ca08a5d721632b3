//! Proof wire format
//!
//! ```text
//! array [
//!   header:  [WIRE_VERSION, kind]
//!   step_0 .. step_n-1:  17-element array per internal node, root first;
//!                        [0..16] empty or child commitment, [16] empty
//!   leaf:    encoded leaf node (Inclusion and ExclusionLeaf only)
//! ]
//! ```
//! Arrays use the same canonical encoding as stored nodes, so a verifier
//! recomputes commitments from exactly the bytes it received.

use super::{ProofKind, TrieProof};
use crate::commitment::CommitmentScheme;
use crate::model::encoding::{decode_array, encode_array};
use crate::model::node::{decode_leaf, BRANCH_SLOTS, META_SLOT};
use crate::model::nibble::MAX_NIBBLES;
use crate::model::{nibble_at, Hash, HashFunction, JmtNode, LeafNode};
use crate::{Error, Result};

pub const WIRE_VERSION: u8 = 1;

/// Serialize `proof` for `key`.
///
/// The proof is checked first: it must be about `key` and must hash up to
/// its own root, otherwise `Error::InvalidProof`.
pub fn to_wire(
    proof: &TrieProof,
    key: &[u8],
    hash_fn: &dyn HashFunction,
    scheme: &dyn CommitmentScheme,
) -> Result<Vec<u8>> {
    let key_hash = hash_fn.digest(key);
    if key_hash != proof.key_hash {
        return Err(Error::InvalidProof("proof was generated for another key".into()));
    }
    if proof.steps.len() > MAX_NIBBLES {
        return Err(Error::InvalidProof(format!("{} steps", proof.steps.len())));
    }
    match (proof.kind, &proof.leaf) {
        (ProofKind::Inclusion, Some(leaf)) if leaf.key_hash == key_hash => {}
        (ProofKind::ExclusionLeaf, Some(leaf)) if leaf.key_hash != key_hash => {}
        (ProofKind::ExclusionEmpty, None) => {}
        (kind, _) => {
            return Err(Error::InvalidProof(format!(
                "terminal does not match {:?} proof",
                kind
            )))
        }
    }
    let root = fold_root(&key_hash, proof.kind, &proof.steps, proof.leaf.as_ref(), scheme)
        .ok_or_else(|| Error::InvalidProof("path does not chain".into()))?;
    if root != proof.root_hash {
        return Err(Error::InvalidProof(format!(
            "path hashes to {} not {}",
            root.short(),
            proof.root_hash.short()
        )));
    }

    let mut items: Vec<Vec<u8>> = Vec::with_capacity(proof.steps.len() + 2);
    items.push(vec![WIRE_VERSION, proof.kind.tag()]);
    for step in &proof.steps {
        items.push(encode_step(step));
    }
    if let Some(leaf) = proof.leaf {
        items.push(JmtNode::Leaf(leaf).encode());
    }
    Ok(encode_array(&items))
}

/// Check a wire proof for the claim `key -> value` (`including`) or
/// `key` absent (`!including`, `value` must be `None`) under `expected_root`.
///
/// Any malformed or tampered input yields `false`.
pub fn verify(
    expected_root: &Hash,
    key: &[u8],
    value: Option<&[u8]>,
    including: bool,
    wire: &[u8],
    hash_fn: &dyn HashFunction,
    scheme: &dyn CommitmentScheme,
) -> bool {
    let Ok((kind, steps, leaf)) = decode_wire(wire) else {
        return false;
    };
    let key_hash = hash_fn.digest(key);

    let claim_holds = match (including, kind, value, &leaf) {
        (true, ProofKind::Inclusion, Some(value), Some(leaf)) => {
            leaf.key_hash == key_hash && leaf.value_hash == hash_fn.digest(value)
        }
        (false, ProofKind::ExclusionLeaf, None, Some(leaf)) => {
            leaf.key_hash != key_hash
                && (0..steps.len()).all(|i| nibble_at(&leaf.key_hash, i) == nibble_at(&key_hash, i))
        }
        (false, ProofKind::ExclusionEmpty, None, None) => true,
        _ => false,
    };
    if !claim_holds {
        return false;
    }

    fold_root(&key_hash, kind, &steps, leaf.as_ref(), scheme)
        .is_some_and(|root| root == *expected_root)
}

/// Hash from the terminal up through `steps` along `key_hash`.
///
/// `None` when a step does not hold the running commitment in the key's slot,
/// or is not a valid branch.
fn fold_root(
    key_hash: &Hash,
    kind: ProofKind,
    steps: &[[Option<Hash>; 16]],
    leaf: Option<&LeafNode>,
    scheme: &dyn CommitmentScheme,
) -> Option<Hash> {
    let mut current = match (kind, leaf) {
        (ProofKind::ExclusionEmpty, _) => None,
        (_, Some(leaf)) => Some(scheme.commit_leaf(&leaf.key_hash, &leaf.value_hash)),
        (_, None) => return None,
    };
    for (depth, step) in steps.iter().enumerate().rev() {
        // a stored branch is never empty
        if step.iter().all(Option::is_none) {
            return None;
        }
        if step[nibble_at(key_hash, depth) as usize] != current {
            return None;
        }
        current = Some(scheme.commit_branch(step));
    }
    Some(current.unwrap_or_else(|| scheme.null_hash()))
}

fn encode_step(step: &[Option<Hash>; 16]) -> Vec<u8> {
    let mut slots: Vec<&[u8]> = step
        .iter()
        .map(|slot| slot.as_ref().map_or(&[][..], |h| &h.as_bytes()[..]))
        .collect();
    slots.push(&[]);
    encode_array(&slots)
}

type Decoded = (ProofKind, Vec<[Option<Hash>; 16]>, Option<LeafNode>);

fn decode_wire(wire: &[u8]) -> Result<Decoded> {
    let items = decode_array(wire)?;
    let (header, rest) = items
        .split_first()
        .ok_or_else(|| Error::Corruption("empty proof".into()))?;
    let kind = match header.as_slice() {
        [WIRE_VERSION, tag] => ProofKind::from_tag(*tag),
        _ => None,
    }
    .ok_or_else(|| Error::Corruption("bad proof header".into()))?;

    let (step_items, leaf) = match kind {
        ProofKind::ExclusionEmpty => (rest, None),
        ProofKind::Inclusion | ProofKind::ExclusionLeaf => {
            let (leaf_bytes, step_items) = rest
                .split_last()
                .ok_or_else(|| Error::Corruption("proof without leaf".into()))?;
            let slots = decode_array(leaf_bytes)?;
            if slots.len() != 2 {
                return Err(Error::Corruption("proof leaf arity".into()));
            }
            (step_items, Some(decode_leaf(&slots)?))
        }
    };
    if step_items.len() > MAX_NIBBLES {
        return Err(Error::Corruption("proof deeper than a key hash".into()));
    }

    let steps = step_items
        .iter()
        .map(|bytes| decode_step(bytes))
        .collect::<Result<Vec<_>>>()?;
    Ok((kind, steps, leaf))
}

fn decode_step(bytes: &[u8]) -> Result<[Option<Hash>; 16]> {
    let slots = decode_array(bytes)?;
    if slots.len() != BRANCH_SLOTS || !slots[META_SLOT].is_empty() {
        return Err(Error::Corruption("malformed proof step".into()));
    }
    let mut step = [None; 16];
    for (out, slot) in step.iter_mut().zip(&slots[..16]) {
        if !slot.is_empty() {
            *out = Some(
                Hash::from_slice(slot)
                    .ok_or_else(|| Error::Corruption("proof slot length".into()))?,
            );
        }
    }
    Ok(step)
}
