//! Key layout of a trie namespace inside a [`KvBackend`](super::KvBackend)
//!
//! ```text
//! ns 0x00 'n' NodeKey                 -> commitment(32) || node bytes
//! ns 0x00 'h' hash(32) NodeKey        -> (empty)      hash index
//! ns 0x00 'v' key_hash(32) version    -> tag || value  (tag 0 = tombstone)
//! ns 0x00 'r' version                 -> root hash(32)
//! ns 0x00 's' stale_since NodeKey     -> (empty)      stale marker
//! ```
//! Versions are big-endian so byte order is numeric order.

use crate::model::{Hash, NodeKey};
use crate::store::backend::prefix_end;
use crate::{Error, Result};

const NODE: u8 = b'n';
const HASH_INDEX: u8 = b'h';
const VALUE: u8 = b'v';
const ROOT: u8 = b'r';
const STALE: u8 = b's';

/// Key builder for one namespace
#[derive(Clone, Debug)]
pub struct Keyspace {
    namespace: String,
    prefix: Vec<u8>,
}

pub fn validate_namespace(namespace: &str) -> Result<()> {
    if namespace.is_empty()
        || namespace.len() > 64
        || !namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidNamespace(format!(
            "'{}' must be 1-64 ASCII letters, digits, '-' or '_'",
            namespace
        )));
    }
    Ok(())
}

impl Keyspace {
    pub fn new(namespace: &str) -> Result<Self> {
        validate_namespace(namespace)?;
        let mut prefix = namespace.as_bytes().to_vec();
        prefix.push(0);
        Ok(Keyspace {
            namespace: namespace.to_string(),
            prefix,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, tag: u8, parts: &[&[u8]]) -> Vec<u8> {
        let len = parts.iter().map(|p| p.len()).sum::<usize>();
        let mut out = Vec::with_capacity(self.prefix.len() + 1 + len);
        out.extend_from_slice(&self.prefix);
        out.push(tag);
        for part in parts {
            out.extend_from_slice(part);
        }
        out
    }

    /// `[start, end)` covering every key with this tag
    fn section(&self, tag: u8) -> (Vec<u8>, Vec<u8>) {
        let start = self.key(tag, &[]);
        let end = self.key(tag + 1, &[]);
        (start, end)
    }

    /// Strip `prefix || tag` from a key of that section
    fn body<'k>(&self, tag: u8, key: &'k [u8]) -> Result<&'k [u8]> {
        key.strip_prefix(self.prefix.as_slice())
            .and_then(|rest| rest.strip_prefix(&[tag]))
            .ok_or_else(|| Error::Corruption("key outside expected section".into()))
    }

    pub fn node(&self, key: &NodeKey) -> Vec<u8> {
        self.key(NODE, &[&key.encode()])
    }

    pub fn nodes(&self) -> (Vec<u8>, Vec<u8>) {
        self.section(NODE)
    }

    pub fn hash_index(&self, hash: &Hash, key: &NodeKey) -> Vec<u8> {
        self.key(HASH_INDEX, &[hash.as_bytes(), &key.encode()])
    }

    /// Range holding every node key indexed under `hash`
    pub fn hash_index_range(&self, hash: &Hash) -> (Vec<u8>, Vec<u8>) {
        let start = self.key(HASH_INDEX, &[hash.as_bytes()]);
        let end = prefix_end(&start).unwrap_or_else(|| self.section(HASH_INDEX).1);
        (start, end)
    }

    pub fn parse_hash_index(&self, key: &[u8]) -> Result<NodeKey> {
        let body = self.body(HASH_INDEX, key)?;
        if body.len() < Hash::LEN {
            return Err(Error::Corruption("truncated hash index key".into()));
        }
        NodeKey::decode(&body[Hash::LEN..])
    }

    pub fn values(&self) -> (Vec<u8>, Vec<u8>) {
        self.section(VALUE)
    }

    pub fn value(&self, key_hash: &Hash, version: u64) -> Vec<u8> {
        self.key(VALUE, &[key_hash.as_bytes(), &version.to_be_bytes()])
    }

    /// Range of value records for `key_hash` at versions `<= version`
    pub fn value_history(&self, key_hash: &Hash, version: u64) -> (Vec<u8>, Vec<u8>) {
        let start = self.key(VALUE, &[key_hash.as_bytes()]);
        let end = match version.checked_add(1) {
            Some(next) => self.value(key_hash, next),
            None => prefix_end(&start).unwrap_or_else(|| self.section(VALUE).1),
        };
        (start, end)
    }

    pub fn root(&self, version: u64) -> Vec<u8> {
        self.key(ROOT, &[&version.to_be_bytes()])
    }

    pub fn roots(&self) -> (Vec<u8>, Vec<u8>) {
        self.section(ROOT)
    }

    /// Range of root entries with version `<= version`
    pub fn roots_through(&self, version: u64) -> (Vec<u8>, Vec<u8>) {
        let (start, end) = self.roots();
        match version.checked_add(1) {
            Some(next) => (start, self.root(next)),
            None => (start, end),
        }
    }

    pub fn parse_root(&self, key: &[u8]) -> Result<u64> {
        let body = self.body(ROOT, key)?;
        let bytes: [u8; 8] = body
            .try_into()
            .map_err(|_| Error::Corruption("malformed root key".into()))?;
        Ok(u64::from_be_bytes(bytes))
    }

    pub fn stale(&self, stale_since: u64, key: &NodeKey) -> Vec<u8> {
        self.key(STALE, &[&stale_since.to_be_bytes(), &key.encode()])
    }

    pub fn stale_markers(&self) -> (Vec<u8>, Vec<u8>) {
        self.section(STALE)
    }

    /// Range of stale markers with `stale_since < before`
    pub fn stale_before(&self, before: u64) -> (Vec<u8>, Vec<u8>) {
        let start = self.section(STALE).0;
        let end = self.key(STALE, &[&before.to_be_bytes()]);
        (start, end)
    }

    pub fn parse_stale(&self, key: &[u8]) -> Result<(u64, NodeKey)> {
        let body = self.body(STALE, key)?;
        if body.len() < 8 {
            return Err(Error::Corruption("truncated stale marker".into()));
        }
        let mut since = [0u8; 8];
        since.copy_from_slice(&body[..8]);
        Ok((u64::from_be_bytes(since), NodeKey::decode(&body[8..])?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NibblePath;

    #[test]
    fn test_namespace_validation() {
        assert!(Keyspace::new("state-1_a").is_ok());
        assert!(Keyspace::new("").is_err());
        assert!(Keyspace::new("has space").is_err());
        assert!(Keyspace::new("nul\0").is_err());
    }

    #[test]
    fn test_namespaces_do_not_overlap() {
        let a = Keyspace::new("a").unwrap();
        let ab = Keyspace::new("ab").unwrap();
        let (start, end) = a.roots();
        let other = ab.root(1);
        assert!(!(other >= start && other < end));
    }

    #[test]
    fn test_root_keys_order_numerically() {
        let ks = Keyspace::new("ns").unwrap();
        assert!(ks.root(2) < ks.root(10));
        assert!(ks.root(255) < ks.root(256));
        assert_eq!(ks.parse_root(&ks.root(77)).unwrap(), 77);
        let (start, end) = ks.roots_through(5);
        assert!(ks.root(5) >= start && ks.root(5) < end);
        assert!(ks.root(6) >= end);
    }

    #[test]
    fn test_stale_marker_layout() {
        let ks = Keyspace::new("ns").unwrap();
        let node = NodeKey::new(NibblePath::empty().child(4), 3);
        let key = ks.stale(9, &node);
        assert_eq!(ks.parse_stale(&key).unwrap(), (9, node));
        let (start, end) = ks.stale_before(10);
        assert!(key >= start && key < end);
        assert!(key >= ks.stale_before(9).1);
    }

    #[test]
    fn test_value_history_range() {
        let ks = Keyspace::new("ns").unwrap();
        let kh = Hash::from_bytes([3; 32]);
        let (start, end) = ks.value_history(&kh, 4);
        assert!(ks.value(&kh, 4) >= start && ks.value(&kh, 4) < end);
        assert!(ks.value(&kh, 5) >= end);
        let (_, end_max) = ks.value_history(&kh, u64::MAX);
        assert!(ks.value(&kh, u64::MAX) < end_max);
    }

    #[test]
    fn test_hash_index_parse() {
        let ks = Keyspace::new("ns").unwrap();
        let hash = Hash::from_bytes([8; 32]);
        let node = NodeKey::root(12);
        let key = ks.hash_index(&hash, &node);
        assert_eq!(ks.parse_hash_index(&key).unwrap(), node);
        let (start, end) = ks.hash_index_range(&hash);
        assert!(key >= start && key < end);
    }
}
