//! In-memory reference backend

use crate::store::backend::{Durability, KvBackend, WriteBatch, WriteOp};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// `BTreeMap` behind a read-write lock. A batch is applied under one write
/// guard, so readers never observe part of it.
#[derive(Default)]
pub struct MemoryBackend {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

pub(crate) fn apply_ops(map: &mut BTreeMap<Vec<u8>, Vec<u8>>, ops: Vec<WriteOp>) {
    for op in ops {
        match op {
            WriteOp::Put { key, value } => {
                map.insert(key, value);
            }
            WriteOp::Delete { key } => {
                map.remove(&key);
            }
        }
    }
}

/// `[start, end)` of `map`; callers must ensure `start < end`
pub(crate) fn range_of<'a>(
    map: &'a BTreeMap<Vec<u8>, Vec<u8>>,
    start: &[u8],
    end: &[u8],
) -> impl DoubleEndedIterator<Item = (&'a Vec<u8>, &'a Vec<u8>)> {
    map.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
}

impl KvBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn last_in_range(&self, start: &[u8], end: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(None);
        }
        let map = self.map.read();
        let last = range_of(&map, start, end)
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()));
        Ok(last)
    }

    fn scan_range(
        &self,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let map = self.map.read();
        Ok(range_of(&map, start, end)
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch, _durability: Durability) -> Result<()> {
        apply_ops(&mut self.map.write(), batch.into_ops());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::conformance;

    #[test]
    fn test_memory_ranges() {
        conformance::ranges(&MemoryBackend::new());
    }

    #[test]
    fn test_memory_batches() {
        conformance::batch_overwrite_and_delete(&MemoryBackend::new());
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let backend = MemoryBackend::new();
        backend.put(b"m", b"1").unwrap();
        assert!(backend.scan_range(b"z", b"a", 10).unwrap().is_empty());
        assert!(backend.last_in_range(b"z", b"a").unwrap().is_none());
    }
}
