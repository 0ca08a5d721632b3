//! Child references read straight from stored node bytes

use crate::model::encoding::decode_array;
use crate::model::node::{BRANCH_SLOTS, META_SLOT};
use crate::model::Hash;
use crate::{Error, Result};

/// Extracts the commitments a stored node points at.
///
/// The collector marks through this instead of fully decoding nodes, so it
/// keeps working on node layouts the engine itself does not produce.
pub trait NodeRefParser: Send + Sync {
    fn child_refs(&self, bytes: &[u8]) -> Result<Vec<Hash>>;
}

/// Parser for the array node encoding
#[derive(Clone, Copy, Debug, Default)]
pub struct ArrayRefParser;

impl NodeRefParser for ArrayRefParser {
    fn child_refs(&self, bytes: &[u8]) -> Result<Vec<Hash>> {
        child_refs(bytes)
    }
}

/// Child commitments of an encoded node:
///
/// * 17 slots: every 32-byte slot among the first 16
/// * 2 slots, hex-prefix flag marks a leaf (high nibble 2 or 3): none
/// * 2 slots otherwise (extension): the second slot when it is a 32-byte reference
pub fn child_refs(bytes: &[u8]) -> Result<Vec<Hash>> {
    let items = decode_array(bytes)?;
    match items.len() {
        BRANCH_SLOTS => Ok(items[..META_SLOT]
            .iter()
            .filter_map(|slot| Hash::from_slice(slot))
            .collect()),
        2 => {
            let flag = items[0]
                .first()
                .ok_or_else(|| Error::Corruption("2-slot node with empty path".into()))?;
            if matches!(flag >> 4, 2 | 3) {
                return Ok(Vec::new());
            }
            Ok(Hash::from_slice(&items[1]).into_iter().collect())
        }
        n => Err(Error::Corruption(format!("cannot read references of {}-slot node", n))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::encoding::encode_array;

    #[test]
    fn test_extension_reference() {
        let child = Hash::from_bytes([4; 32]);
        let bytes = encode_array(&[vec![0x00, 0xab], child.as_bytes().to_vec()]);
        assert_eq!(child_refs(&bytes).unwrap(), vec![child]);
        // odd extension with an inline child
        let bytes = encode_array(&[vec![0x1a], vec![1, 2, 3]]);
        assert!(child_refs(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_branch_references() {
        let mut slots = vec![Vec::new(); BRANCH_SLOTS];
        slots[0] = vec![1u8; 32];
        slots[7] = vec![7u8; 32];
        slots[15] = vec![15u8; 32];
        // short slots are inline, not references
        slots[3] = vec![3u8; 5];
        let refs = child_refs(&encode_array(&slots)).unwrap();
        assert_eq!(
            refs,
            vec![
                Hash::from_bytes([1; 32]),
                Hash::from_bytes([7; 32]),
                Hash::from_bytes([15; 32]),
            ]
        );
    }

    #[test]
    fn test_leaf_has_no_references() {
        let bytes = encode_array(&[vec![0x20, 0xab, 0xcd], b"value".to_vec()]);
        assert!(child_refs(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_odd_leaf_flag() {
        let bytes = encode_array(&[vec![0x3f], vec![9u8; 32]]);
        assert!(ArrayRefParser.child_refs(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_anomalies() {
        assert!(child_refs(&encode_array(&[vec![1u8], vec![2], vec![3]])).is_err());
        assert!(child_refs(&encode_array(&[Vec::<u8>::new(), vec![2]])).is_err());
        assert!(child_refs(b"\xff\xff").is_err());
    }
}
