//! Trie node shapes and their canonical byte form
//!
//! Byte layout (see [`encoding`](crate::model::encoding)):
//! ```text
//! Internal: 17-element array
//!   [0..16]  empty, or the 32-byte commitment of the child at that nibble
//!   [16]     child metadata: (kind u8, version u64 BE) per present child,
//!            ascending nibble order; not part of the commitment
//!
//! Leaf: 2-element array
//!   [0]      0x20 || key hash   (hex-prefix flag: leaf, even path of 64 nibbles)
//!   [1]      value hash
//! ```

use crate::commitment::CommitmentScheme;
use crate::model::encoding::{decode_array, encode_array};
use crate::model::Hash;
use crate::{Error, Result};

/// Hex-prefix flag byte for a leaf over an even-length path
pub const LEAF_FLAG: u8 = 0x20;

/// Element count of an encoded internal node
pub const BRANCH_SLOTS: usize = 17;

/// Index of the reserved metadata element of an internal node
pub const META_SLOT: usize = 16;

const CHILD_META_LEN: usize = 9;

/// Kind of node a child reference points at
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Leaf,
    Internal,
}

impl NodeKind {
    fn tag(self) -> u8 {
        match self {
            NodeKind::Leaf => 0,
            NodeKind::Internal => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(NodeKind::Leaf),
            1 => Ok(NodeKind::Internal),
            other => Err(Error::Corruption(format!("unknown child kind {}", other))),
        }
    }
}

/// Reference from an internal node to one child
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Child {
    pub hash: Hash,
    pub version: u64,
    pub kind: NodeKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafNode {
    pub key_hash: Hash,
    pub value_hash: Hash,
}

/// 16-way branch keyed by nibble
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalNode {
    children: [Option<Child>; 16],
}

impl InternalNode {
    pub fn new() -> Self {
        InternalNode::default()
    }

    pub fn child(&self, nibble: u8) -> Option<&Child> {
        self.children[nibble as usize].as_ref()
    }

    pub fn set_child(&mut self, nibble: u8, child: Option<Child>) {
        self.children[nibble as usize] = child;
    }

    /// Present children in nibble order
    pub fn children(&self) -> impl Iterator<Item = (u8, &Child)> {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (i as u8, c)))
    }

    pub fn child_count(&self) -> usize {
        self.children.iter().filter(|c| c.is_some()).count()
    }

    /// The 16 child commitments, as hashed into this node's commitment
    pub fn child_hashes(&self) -> [Option<Hash>; 16] {
        let mut out = [None; 16];
        for (slot, child) in out.iter_mut().zip(self.children.iter()) {
            *slot = child.map(|c| c.hash);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JmtNode {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl JmtNode {
    pub fn kind(&self) -> NodeKind {
        match self {
            JmtNode::Leaf(_) => NodeKind::Leaf,
            JmtNode::Internal(_) => NodeKind::Internal,
        }
    }

    /// Commitment of this node under `scheme`
    pub fn hash(&self, scheme: &dyn CommitmentScheme) -> Hash {
        match self {
            JmtNode::Leaf(leaf) => scheme.commit_leaf(&leaf.key_hash, &leaf.value_hash),
            JmtNode::Internal(node) => scheme.commit_branch(&node.child_hashes()),
        }
    }

    /// Canonical byte form
    pub fn encode(&self) -> Vec<u8> {
        match self {
            JmtNode::Leaf(leaf) => encode_array(&[
                leaf_path(&leaf.key_hash),
                leaf.value_hash.as_bytes().to_vec(),
            ]),
            JmtNode::Internal(node) => {
                let mut slots: Vec<Vec<u8>> = Vec::with_capacity(BRANCH_SLOTS);
                let mut meta = Vec::with_capacity(node.child_count() * CHILD_META_LEN);
                for child in &node.children {
                    match child {
                        Some(c) => {
                            slots.push(c.hash.as_bytes().to_vec());
                            meta.push(c.kind.tag());
                            meta.extend_from_slice(&c.version.to_be_bytes());
                        }
                        None => slots.push(Vec::new()),
                    }
                }
                slots.push(meta);
                encode_array(&slots)
            }
        }
    }

    /// Parse a canonical byte form; any deviation is `Error::Corruption`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let items = decode_array(bytes)?;
        match items.len() {
            2 => decode_leaf(&items).map(JmtNode::Leaf),
            BRANCH_SLOTS => decode_internal(&items).map(JmtNode::Internal),
            n => Err(Error::Corruption(format!("unexpected node arity {}", n))),
        }
    }
}

/// Hex-prefix encoded leaf path: flag byte followed by the full key hash
pub(crate) fn leaf_path(key_hash: &Hash) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + Hash::LEN);
    out.push(LEAF_FLAG);
    out.extend_from_slice(key_hash.as_bytes());
    out
}

pub(crate) fn decode_leaf(items: &[Vec<u8>]) -> Result<LeafNode> {
    let path = &items[0];
    if path.first() != Some(&LEAF_FLAG) {
        return Err(Error::Corruption(format!(
            "2-slot node is not a leaf (flag {:?})",
            path.first()
        )));
    }
    let key_hash = Hash::from_slice(&path[1..])
        .ok_or_else(|| Error::Corruption(format!("leaf path of {} bytes", path.len())))?;
    let value_hash = Hash::from_slice(&items[1])
        .ok_or_else(|| Error::Corruption(format!("leaf value hash of {} bytes", items[1].len())))?;
    Ok(LeafNode { key_hash, value_hash })
}

fn decode_internal(items: &[Vec<u8>]) -> Result<InternalNode> {
    let meta = &items[META_SLOT];
    let mut meta_chunks = meta.chunks(CHILD_META_LEN);
    let mut node = InternalNode::new();
    for (nibble, slot) in items[..16].iter().enumerate() {
        if slot.is_empty() {
            continue;
        }
        let hash = Hash::from_slice(slot).ok_or_else(|| {
            Error::Corruption(format!("child slot {} holds {} bytes", nibble, slot.len()))
        })?;
        let entry = meta_chunks
            .next()
            .filter(|e| e.len() == CHILD_META_LEN)
            .ok_or_else(|| Error::Corruption("child metadata too short".into()))?;
        let mut version = [0u8; 8];
        version.copy_from_slice(&entry[1..]);
        node.children[nibble] = Some(Child {
            hash,
            version: u64::from_be_bytes(version),
            kind: NodeKind::from_tag(entry[0])?,
        });
    }
    if meta_chunks.next().is_some() {
        return Err(Error::Corruption("child metadata too long".into()));
    }
    if node.child_count() == 0 {
        return Err(Error::Corruption("internal node without children".into()));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitment::ClassicCommitment;
    use crate::gc::refs::child_refs;
    use crate::model::hash::Blake3Hasher;
    use std::sync::Arc;

    fn h(byte: u8) -> Hash {
        Hash::from_bytes([byte; 32])
    }

    fn sample_internal() -> InternalNode {
        let mut node = InternalNode::new();
        node.set_child(2, Some(Child { hash: h(1), version: 5, kind: NodeKind::Leaf }));
        node.set_child(9, Some(Child { hash: h(2), version: 3, kind: NodeKind::Internal }));
        node
    }

    #[test]
    fn test_leaf_decode_of_encode() {
        let node = JmtNode::Leaf(LeafNode { key_hash: h(7), value_hash: h(8) });
        let bytes = node.encode();
        assert_eq!(JmtNode::decode(&bytes).unwrap(), node);
        assert!(child_refs(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_internal_decode_of_encode() {
        let node = JmtNode::Internal(sample_internal());
        let bytes = node.encode();
        assert_eq!(JmtNode::decode(&bytes).unwrap(), node);
        assert_eq!(child_refs(&bytes).unwrap(), vec![h(1), h(2)]);
    }

    #[test]
    fn test_metadata_not_committed() {
        let scheme = ClassicCommitment::new(Arc::new(Blake3Hasher));
        let a = sample_internal();
        let mut b = sample_internal();
        b.set_child(2, Some(Child { hash: h(1), version: 99, kind: NodeKind::Leaf }));
        assert_ne!(JmtNode::Internal(a.clone()).encode(), JmtNode::Internal(b.clone()).encode());
        assert_eq!(
            JmtNode::Internal(a).hash(&scheme),
            JmtNode::Internal(b).hash(&scheme)
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // wrong arity
        assert!(JmtNode::decode(&encode_array(&[vec![1u8]])).is_err());
        // extension flag in a 2-slot node
        let mut path = leaf_path(&h(1));
        path[0] = 0x00;
        assert!(JmtNode::decode(&encode_array(&[path, h(2).as_bytes().to_vec()])).is_err());
        // short value hash
        assert!(JmtNode::decode(&encode_array(&[leaf_path(&h(1)), vec![0u8; 31]])).is_err());
        // metadata that does not match the populated slots
        let mut slots = vec![Vec::new(); BRANCH_SLOTS];
        slots[0] = h(3).as_bytes().to_vec();
        assert!(JmtNode::decode(&encode_array(&slots)).is_err());
        // no children at all
        assert!(JmtNode::decode(&encode_array(&vec![Vec::<u8>::new(); BRANCH_SLOTS])).is_err());
    }

    #[test]
    fn test_children_iterate_in_nibble_order() {
        let node = sample_internal();
        let nibbles: Vec<u8> = node.children().map(|(n, _)| n).collect();
        assert_eq!(nibbles, vec![2, 9]);
        assert_eq!(node.child_count(), 2);
        assert_eq!(node.child_hashes()[9], Some(h(2)));
    }
}
