//! Nibble paths: the 4-bit digits a key hash is descended by

use crate::model::Hash;
use crate::{Error, Result};
use std::fmt;

/// Maximum depth of a path derived from a 32-byte hash
pub const MAX_NIBBLES: usize = Hash::LEN * 2;

/// Nibble `index` of a hash without materialising its path
pub fn nibble_at(hash: &Hash, index: usize) -> u8 {
    let byte = hash.as_bytes()[index / 2];
    if index % 2 == 0 {
        byte >> 4
    } else {
        byte & 0x0f
    }
}

/// An immutable sequence of 4-bit values
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NibblePath {
    nibbles: Vec<u8>,
}

impl NibblePath {
    /// The empty path (the root position)
    pub fn empty() -> Self {
        NibblePath::default()
    }

    /// Expand bytes into their high/low nibbles
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let nibbles = bytes.iter().flat_map(|b| [b >> 4, b & 0x0f]).collect();
        NibblePath { nibbles }
    }

    /// Full-depth path of a key hash
    pub fn from_hash(hash: &Hash) -> Self {
        Self::from_bytes(hash.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.nibbles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nibbles.is_empty()
    }

    /// Nibble at `index`; panics past the end like slice indexing
    pub fn get(&self, index: usize) -> u8 {
        self.nibbles[index]
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.nibbles.iter().copied()
    }

    /// A new path one nibble longer
    pub fn child(&self, nibble: u8) -> Self {
        debug_assert!(nibble < 16);
        let mut nibbles = Vec::with_capacity(self.nibbles.len() + 1);
        nibbles.extend_from_slice(&self.nibbles);
        nibbles.push(nibble & 0x0f);
        NibblePath { nibbles }
    }

    /// The first `len` nibbles
    pub fn prefix(&self, len: usize) -> Self {
        NibblePath {
            nibbles: self.nibbles[..len.min(self.nibbles.len())].to_vec(),
        }
    }

    pub fn starts_with(&self, other: &NibblePath) -> bool {
        self.nibbles.starts_with(&other.nibbles)
    }

    /// Number of leading nibbles shared with `other`
    pub fn common_prefix_len(&self, other: &NibblePath) -> usize {
        self.nibbles
            .iter()
            .zip(other.nibbles.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Pack two nibbles per byte, high nibble first, odd tail padded with 0
    pub fn to_packed(&self) -> Vec<u8> {
        self.nibbles
            .chunks(2)
            .map(|pair| (pair[0] << 4) | pair.get(1).copied().unwrap_or(0))
            .collect()
    }

    /// Inverse of [`to_packed`](Self::to_packed)
    pub fn from_packed(len: usize, packed: &[u8]) -> Result<Self> {
        if len > MAX_NIBBLES || packed.len() != len.div_ceil(2) {
            return Err(Error::Corruption(format!(
                "packed path of {} bytes cannot hold {} nibbles",
                packed.len(),
                len
            )));
        }
        if len % 2 == 1 && packed[packed.len() - 1] & 0x0f != 0 {
            return Err(Error::Corruption("non-zero padding nibble".into()));
        }
        let mut path = Self::from_bytes(packed);
        path.nibbles.truncate(len);
        Ok(path)
    }
}

impl fmt::Display for NibblePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nibbles.is_empty() {
            return write!(f, "<root>");
        }
        for n in &self.nibbles {
            write!(f, "{:x}", n)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NibblePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NibblePath({})", self)
    }
}
