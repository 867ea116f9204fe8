//! Content-addressed key/value backends for trie nodes and contract code.
//!
//! Keys are always 32-byte keccak hashes of the stored bytes, so the store
//! is logically append-only: a key is never rebound to different contents
//! and nothing is ever deleted. Old trie roots therefore stay resolvable
//! forever, which is what makes state snapshots free.

use std::collections::HashMap;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use ethereum_types::H256;
use parking_lot::RwLock;
use thiserror::Error;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a backing store. These are corruption-class: nothing
/// above the trie layer recovers from them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An underlying I/O operation failed.
    #[error("store i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// A log record header promised more bytes than the file holds.
    #[error("log store record at offset {0} is truncated")]
    TruncatedRecord(u64),
}

/// An opaque `get`/`put` store keyed by 32-byte hashes.
pub trait KeyValueStore: Send + Sync {
    /// Looks a key up, returning its bytes if present.
    fn get(&self, key: H256) -> StoreResult<Option<Bytes>>;

    /// Binds `key` to `value`. Keys are content hashes, so rebinding an
    /// existing key is a no-op.
    fn put(&mut self, key: H256, value: Bytes) -> StoreResult<()>;
}

/// An in-memory store; the default for tests and short-lived state.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: HashMap<H256, Bytes>,
}

impl MemoryStore {
    /// An empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: H256) -> StoreResult<Option<Bytes>> {
        Ok(self.entries.get(&key).cloned())
    }

    fn put(&mut self, key: H256, value: Bytes) -> StoreResult<()> {
        self.entries.entry(key).or_insert(value);
        Ok(())
    }
}

/// A disk-backed log-structured store.
///
/// The file is a flat sequence of records, `key(32) ‖ len(4, big-endian) ‖
/// payload`, appended in arrival order. An in-memory offset index is rebuilt
/// by scanning the log on open; lookups seek straight to the payload.
pub struct LogStore {
    file: File,
    index: HashMap<H256, (u64, u32)>,
    end: u64,
}

impl LogStore {
    /// Opens (or creates) a log file and rebuilds the key index from it.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        let mut index = HashMap::new();
        let mut offset = 0u64;
        let mut header = [0u8; 36];
        while offset < len {
            if len - offset < 36 {
                return Err(StoreError::TruncatedRecord(offset));
            }
            file.read_exact(&mut header)?;
            let key = H256::from_slice(&header[..32]);
            let payload_len = u32::from_be_bytes([header[32], header[33], header[34], header[35]]);
            let payload_start = offset + 36;
            if len - payload_start < payload_len as u64 {
                return Err(StoreError::TruncatedRecord(offset));
            }
            index.insert(key, (payload_start, payload_len));
            offset = payload_start + payload_len as u64;
            file.seek(SeekFrom::Start(offset))?;
        }

        Ok(Self {
            file,
            index,
            end: len,
        })
    }
}

impl KeyValueStore for LogStore {
    fn get(&self, key: H256) -> StoreResult<Option<Bytes>> {
        let Some(&(offset, len)) = self.index.get(&key) else {
            return Ok(None);
        };
        let mut payload = vec![0u8; len as usize];
        // `Read`/`Seek` are implemented for `&File`, so lookups stay `&self`.
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut payload)?;
        Ok(Some(payload.into()))
    }

    fn put(&mut self, key: H256, value: Bytes) -> StoreResult<()> {
        if self.index.contains_key(&key) {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(self.end))?;
        self.file.write_all(key.as_bytes())?;
        self.file.write_all(&(value.len() as u32).to_be_bytes())?;
        self.file.write_all(&value)?;
        self.index.insert(key, (self.end + 36, value.len() as u32));
        self.end += 36 + value.len() as u64;
        Ok(())
    }
}

impl fmt::Debug for LogStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogStore")
            .field("keys", &self.index.len())
            .field("bytes", &self.end)
            .finish()
    }
}

/// A cheaply clonable handle to a shared store.
///
/// Every trie and world-state value holds one of these, so cloning a trie
/// (the snapshot operation) shares the backing store rather than copying it.
#[derive(Clone)]
pub struct StoreHandle(Arc<RwLock<dyn KeyValueStore>>);

impl StoreHandle {
    /// Wraps a store in a shared handle.
    pub fn new<S: KeyValueStore + 'static>(store: S) -> Self {
        Self(Arc::new(RwLock::new(store)))
    }

    /// A handle over a fresh [`MemoryStore`].
    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Looks a key up in the shared store.
    pub fn get(&self, key: H256) -> StoreResult<Option<Bytes>> {
        self.0.read().get(key)
    }

    /// Writes a key into the shared store.
    pub fn put(&self, key: H256, value: Bytes) -> StoreResult<()> {
        self.0.write().put(key, value)
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StoreHandle(..)")
    }
}

#[cfg(test)]
mod tests {
    use keccak_hash::keccak;

    use super::*;

    fn entry(data: &[u8]) -> (H256, Bytes) {
        (keccak(data), Bytes::copy_from_slice(data))
    }

    #[test]
    fn memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        let (k, v) = entry(b"node bytes");
        assert!(store.get(k).unwrap().is_none());
        store.put(k, v.clone()).unwrap();
        assert_eq!(store.get(k).unwrap(), Some(v));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn log_store_roundtrip_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.log");

        let (k1, v1) = entry(b"first");
        let (k2, v2) = entry(&[0xab; 100]);

        {
            let mut store = LogStore::open(&path).unwrap();
            store.put(k1, v1.clone()).unwrap();
            store.put(k2, v2.clone()).unwrap();
            assert_eq!(store.get(k1).unwrap(), Some(v1.clone()));
        }

        // The index must survive a reopen by rescanning the log.
        let store = LogStore::open(&path).unwrap();
        assert_eq!(store.get(k1).unwrap(), Some(v1));
        assert_eq!(store.get(k2).unwrap(), Some(v2));
        assert!(store.get(keccak(b"absent")).unwrap().is_none());
    }

    #[test]
    fn log_store_rejects_torn_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nodes.log");
        {
            let mut store = LogStore::open(&path).unwrap();
            let (k, v) = entry(b"whole record");
            store.put(k, v).unwrap();
        }
        // Chop the tail off the payload.
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();

        assert!(matches!(
            LogStore::open(&path).unwrap_err(),
            StoreError::TruncatedRecord(0)
        ));
    }

    #[test]
    fn content_addressed_put_is_idempotent() {
        let mut store = MemoryStore::new();
        let (k, v) = entry(b"same");
        store.put(k, v.clone()).unwrap();
        store.put(k, v.clone()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(k).unwrap(), Some(v));
    }
}
