//! Key-value storage abstraction the trie reads committed nodes from and
//! that proof builders write witnesses into.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::trie::ZkTrieResult;

/// The backend contract. Methods take `&self` so a single backend can be
/// shared across trie copies and proof writers; implementations provide
/// their own interior mutability.
pub trait ZktrieDatabase: Send + Sync {
    /// Looks up the value stored under `key`.
    fn get(&self, key: &[u8]) -> ZkTrieResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, overwriting any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> ZkTrieResult<()>;

    /// Applies a batch of writes. Callers may not observe a partial batch.
    fn write_batch(&self, writes: &[(Vec<u8>, Vec<u8>)]) -> ZkTrieResult<()> {
        for (k, v) in writes {
            self.put(k, v)?;
        }
        Ok(())
    }
}

/// A `HashMap` backend for tests and proof assembly.
#[derive(Debug, Default)]
pub struct MemoryDb {
    db: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDb {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.db.read().len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.db.read().is_empty()
    }

    /// All entries, sorted by key.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out: Vec<_> = self
            .db
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort();
        out
    }
}

impl ZktrieDatabase for MemoryDb {
    fn get(&self, key: &[u8]) -> ZkTrieResult<Option<Vec<u8>>> {
        Ok(self.db.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> ZkTrieResult<()> {
        self.db.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn write_batch(&self, writes: &[(Vec<u8>, Vec<u8>)]) -> ZkTrieResult<()> {
        let mut db = self.db.write();
        for (k, v) in writes {
            db.insert(k.clone(), v.clone());
        }
        Ok(())
    }
}

// Let `&D` be used wherever a backend is expected.
impl<T: ZktrieDatabase + ?Sized> ZktrieDatabase for &T {
    fn get(&self, key: &[u8]) -> ZkTrieResult<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &[u8], value: &[u8]) -> ZkTrieResult<()> {
        (**self).put(key, value)
    }

    fn write_batch(&self, writes: &[(Vec<u8>, Vec<u8>)]) -> ZkTrieResult<()> {
        (**self).write_batch(writes)
    }
}
