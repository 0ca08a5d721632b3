//! Node addressing: path prefix plus creation version

use crate::model::nibble::{NibblePath, MAX_NIBBLES};
use crate::{Error, Result};
use std::fmt;

/// Immutable address of a node written at `version` at position `path`
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    path: NibblePath,
    version: u64,
}

impl NodeKey {
    pub fn new(path: NibblePath, version: u64) -> Self {
        NodeKey { path, version }
    }

    /// The root position at `version`
    pub fn root(version: u64) -> Self {
        NodeKey::new(NibblePath::empty(), version)
    }

    pub fn path(&self) -> &NibblePath {
        &self.path
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// `[nibble count][packed nibbles][version u64 BE]`
    ///
    /// Self-delimiting, so it can be embedded inside longer store keys.
    pub fn encode(&self) -> Vec<u8> {
        let packed = self.path.to_packed();
        let mut out = Vec::with_capacity(1 + packed.len() + 8);
        out.push(self.path.len() as u8);
        out.extend_from_slice(&packed);
        out.extend_from_slice(&self.version.to_be_bytes());
        out
    }

    /// Decode a key produced by [`encode`](Self::encode); returns the key and
    /// the number of bytes consumed.
    pub fn decode_prefix(bytes: &[u8]) -> Result<(Self, usize)> {
        let (&len, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Corruption("empty node key".into()))?;
        let len = len as usize;
        if len > MAX_NIBBLES {
            return Err(Error::Corruption(format!("node key path of {} nibbles", len)));
        }
        let packed_len = len.div_ceil(2);
        if rest.len() < packed_len + 8 {
            return Err(Error::Corruption("truncated node key".into()));
        }
        let path = NibblePath::from_packed(len, &rest[..packed_len])?;
        let mut version = [0u8; 8];
        version.copy_from_slice(&rest[packed_len..packed_len + 8]);
        Ok((
            NodeKey::new(path, u64::from_be_bytes(version)),
            1 + packed_len + 8,
        ))
    }

    /// Decode a key that must span all of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (key, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(Error::Corruption(format!(
                "{} trailing bytes after node key",
                bytes.len() - used
            )));
        }
        Ok(key)
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.version)
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey({})", self)
    }
}
