//! RocksDB-backed key-value storage.
//!
//! Implements the chain store's [`KvStore`] contract: ordered byte keys and
//! atomic write batches. The chain's single-byte prefixes partition the key
//! space, so one default column family suffices.

use std::path::Path;

use rocksdb::{IteratorMode, Options, WriteBatch as RocksBatch, DB};

use kestrel_chain::error::StoreError;
use kestrel_chain::kv::{KvOp, KvStore, WriteBatch};

/// Persistent store over RocksDB.
pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Backend(e.to_string()))
    }
}

impl KvStore for RocksKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut rocks = RocksBatch::default();
        for op in batch.ops() {
            match op {
                KvOp::Put(key, value) => rocks.put(key, value),
                KvOp::Delete(key) => rocks.delete(key),
            }
        }
        self.db
            .write(rocks)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(tag: &str) -> (RocksKv, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "kestrel-rockskv-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        (RocksKv::open(&path).unwrap(), path)
    }

    #[test]
    fn batch_round_trip() {
        let (mut kv, path) = temp_store("roundtrip");
        let mut batch = WriteBatch::new();
        batch.put(b"a".to_vec(), b"1".to_vec());
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"a".to_vec());
        kv.write(batch).unwrap();

        assert_eq!(kv.get(b"a").unwrap(), None);
        assert_eq!(kv.get(b"b").unwrap(), Some(b"2".to_vec()));
        drop(kv);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn prefix_scan_ordered() {
        let (mut kv, path) = temp_store("scan");
        let mut batch = WriteBatch::new();
        batch.put(b"c\x02".to_vec(), b"two".to_vec());
        batch.put(b"c\x01".to_vec(), b"one".to_vec());
        batch.put(b"d\x00".to_vec(), b"other".to_vec());
        kv.write(batch).unwrap();

        let scanned = kv.scan_prefix(b"c").unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].1, b"one");
        assert_eq!(scanned[1].1, b"two");
        drop(kv);
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn persists_across_reopen() {
        let (mut kv, path) = temp_store("reopen");
        let mut batch = WriteBatch::new();
        batch.put(b"key".to_vec(), b"value".to_vec());
        kv.write(batch).unwrap();
        kv.flush().unwrap();
        drop(kv);

        let kv = RocksKv::open(&path).unwrap();
        assert_eq!(kv.get(b"key").unwrap(), Some(b"value".to_vec()));
        drop(kv);
        let _ = std::fs::remove_dir_all(path);
    }
}
