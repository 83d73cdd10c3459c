//! Ordered byte-keyed storage abstraction with atomic write batches.
//!
//! The chain store is written against this trait; [`MemoryKv`] backs tests
//! and the production node supplies a RocksDB implementation.

use std::collections::BTreeMap;

use crate::error::StoreError;

/// One staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BatchOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// A set of mutations applied atomically.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete(key.into()));
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }

    /// Iterate the staged mutations in order; backends translate the batch
    /// into their native form through this.
    pub fn ops(&self) -> impl Iterator<Item = KvOp<'_>> {
        self.ops.iter().map(|op| match op {
            BatchOp::Put(key, value) => KvOp::Put(key, value),
            BatchOp::Delete(key) => KvOp::Delete(key),
        })
    }
}

/// A borrowed view of one staged mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvOp<'a> {
    Put(&'a [u8], &'a [u8]),
    Delete(&'a [u8]),
}

/// Ordered byte-keyed storage with atomic batches.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Apply every mutation in the batch atomically, in order.
    fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError>;

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    fn has(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.get(key)?.is_some())
    }
}

/// In-memory store over a `BTreeMap`. Test backend; no persistence.
#[derive(Debug, Default)]
pub struct MemoryKv {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.map.get(key).cloned())
    }

    fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        for op in batch.into_ops() {
            match op {
                BatchOp::Put(key, value) => {
                    self.map.insert(key, value);
                }
                BatchOp::Delete(key) => {
                    self.map.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .map
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_applies_in_order() {
        let mut kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"a".to_vec(), b"2".to_vec());
        batch.delete(b"missing".to_vec());
        kv.write(batch).unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn put_then_delete_in_one_batch() {
        let mut kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"k".to_vec(), b"v".to_vec());
        batch.delete(b"k".to_vec());
        kv.write(batch).unwrap();
        assert_eq!(kv.get(b"k").unwrap(), None);
    }

    #[test]
    fn scan_prefix_ordered() {
        let mut kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"c\x02".to_vec(), b"two".to_vec());
        batch.put(b"c\x01".to_vec(), b"one".to_vec());
        batch.put(b"d\x01".to_vec(), b"other".to_vec());
        kv.write(batch).unwrap();

        let entries = kv.scan_prefix(b"c").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"c\x01");
        assert_eq!(entries[1].0, b"c\x02");
    }

    #[test]
    fn scan_empty_prefix_returns_all() {
        let mut kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        kv.write(batch).unwrap();
        assert_eq!(kv.scan_prefix(b"").unwrap().len(), 2);
    }

    #[test]
    fn has_delegates_to_get() {
        let mut kv = MemoryKv::new();
        let mut batch = WriteBatch::new();
        batch.put(b"x".to_vec(), vec![]);
        kv.write(batch).unwrap();
        assert!(kv.has(b"x").unwrap());
        assert!(!kv.has(b"y").unwrap());
    }
}
