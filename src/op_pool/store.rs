use std::path::Path;

use anyhow::Context;
#[cfg(test)]
use mockall::automock;
use rocksdb::{Direction, IteratorMode, Options, DB};

/// Embedded key-value store behind the mempool and reputation persistence.
///
/// Keys are namespaced by prefix (`op/…`, `rep/…`) so that each component
/// can restore its own slice with a single range scan.
#[cfg_attr(test, automock)]
pub trait Store: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>>;

    fn put(&self, key: &[u8], value: Vec<u8>) -> anyhow::Result<()>;

    fn delete(&self, key: &[u8]) -> anyhow::Result<()>;

    fn range_by_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

pub struct RocksDbStore {
    db: DB,
}

impl RocksDbStore {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db = DB::open(&options, path).context("should open data directory")?;
        Ok(Self { db })
    }
}

impl Store for RocksDbStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        self.db.get(key).context("store get failed")
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> anyhow::Result<()> {
        self.db.put(key, value).context("store put failed")
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.db.delete(key).context("store delete failed")
    }

    fn range_by_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, value) = item.context("store iteration failed")?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }
}

/// In-memory store used by tests.
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::RwLock<std::collections::BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[cfg(test)]
impl Store for MemoryStore {
    fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: Vec<u8>) -> anyhow::Result<()> {
        self.entries.write().insert(key.to_vec(), value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> anyhow::Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn range_by_prefix(&self, prefix: &[u8]) -> anyhow::Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .entries
            .read()
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
    fn memory_store_prefix_scan() {
        let store = MemoryStore::default();
        store.put(b"op/a/1", b"one".to_vec()).unwrap();
        store.put(b"op/a/2", b"two".to_vec()).unwrap();
        store.put(b"op/b/1", b"other".to_vec()).unwrap();
        store.put(b"rep/a", b"rep".to_vec()).unwrap();

        let entries = store.range_by_prefix(b"op/a/").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1, b"one".to_vec());
        assert_eq!(entries[1].1, b"two".to_vec());

        store.delete(b"op/a/1").unwrap();
        assert_eq!(store.range_by_prefix(b"op/a/").unwrap().len(), 1);
        assert!(store.get(b"op/a/1").unwrap().is_none());
    }
}
