//! 32-byte digests and the pluggable hash function

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// A 32-byte digest: key hashes, value hashes and node commitments
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// Length of a digest in bytes
    pub const LEN: usize = 32;

    /// The all-zero hash. Never produced as a node commitment.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Create a hash from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Create a hash from a slice, `None` unless it is exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash(arr))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        Hash::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }

    /// Get a short prefix for display (first 7 chars, like git)
    pub fn short(&self) -> String {
        self.to_hex()[..7].to_string()
    }

    /// Check if this is the zero hash
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A `bytes -> 32 bytes` digest function.
///
/// Injected wherever keys and values are hashed so tests can swap in
/// deterministic stubs and deployments can pick another primitive.
pub trait HashFunction: Send + Sync {
    /// Hash a single buffer
    fn digest(&self, data: &[u8]) -> Hash;

    /// Hash the concatenation of several buffers
    fn digest_parts(&self, parts: &[&[u8]]) -> Hash {
        self.digest(&parts.concat())
    }

    /// Short identifier recorded in configs and reports
    fn name(&self) -> &'static str;
}

/// BLAKE3, the default hash function
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake3Hasher;

impl HashFunction for Blake3Hasher {
    fn digest(&self, data: &[u8]) -> Hash {
        Hash(*blake3::hash(data).as_bytes())
    }

    fn digest_parts(&self, parts: &[&[u8]]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        for part in parts {
            hasher.update(part);
        }
        Hash(*hasher.finalize().as_bytes())
    }

    fn name(&self) -> &'static str {
        "blake3"
    }
}

type Blake2b256 = Blake2b<U32>;

/// BLAKE2b with a 256-bit output
#[derive(Clone, Copy, Debug, Default)]
pub struct Blake2b256Hasher;

impl Blake2b256Hasher {
    fn finish(hasher: Blake2b256) -> Hash {
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        Hash(out)
    }
}

impl HashFunction for Blake2b256Hasher {
    fn digest(&self, data: &[u8]) -> Hash {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        Self::finish(hasher)
    }

    fn digest_parts(&self, parts: &[&[u8]]) -> Hash {
        let mut hasher = Blake2b256::new();
        for part in parts {
            hasher.update(part);
        }
        Self::finish(hasher)
    }

    fn name(&self) -> &'static str {
        "blake2b256"
    }
}

/// Hash functions selectable from configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashAlgorithm {
    #[default]
    Blake3,
    Blake2b256,
}

impl HashAlgorithm {
    /// Instantiate the selected function
    pub fn hasher(self) -> Arc<dyn HashFunction> {
        match self {
            HashAlgorithm::Blake3 => Arc::new(Blake3Hasher),
            HashAlgorithm::Blake2b256 => Arc::new(Blake2b256Hasher),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_digest() {
        let h1 = Blake3Hasher.digest(b"hello");
        let h2 = Blake3Hasher.digest(b"hello");
        let h3 = Blake3Hasher.digest(b"world");

        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
    }

    #[test]
    fn test_digest_parts_matches_concatenation() {
        for hasher in [HashAlgorithm::Blake3.hasher(), HashAlgorithm::Blake2b256.hasher()] {
            let joined = hasher.digest(b"leafnode");
            let parts = hasher.digest_parts(&[b"leaf", b"node"]);
            assert_eq!(joined, parts, "{}", hasher.name());
        }
    }

    #[test]
    fn test_algorithms_differ() {
        assert_ne!(Blake3Hasher.digest(b"x"), Blake2b256Hasher.digest(b"x"));
    }

    #[test]
    fn test_hash_hex_roundtrip() {
        let h1 = Blake3Hasher.digest(b"test data");
        let h2 = Hash::from_hex(&h1.to_hex()).unwrap();
        assert_eq!(h1, h2);
        assert!(Hash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(Hash::from_slice(&[1u8; 31]).is_none());
        assert!(Hash::from_slice(&[1u8; 33]).is_none());
        assert_eq!(Hash::from_slice(&[7u8; 32]), Some(Hash::from_bytes([7u8; 32])));
    }

    #[test]
    fn test_hash_short() {
        let h = Blake3Hasher.digest(b"test");
        assert_eq!(h.short().len(), 7);
    }
}
