//! Embedded key-value storage behind a pluggable trait.
//!
//! # Purpose
//! Streams, subscriptions and checkpoints are persisted as self-describing
//! JSON records in a single flat keyspace, distinguished by id prefix.
//! Recovery walks the keyspace by prefix, so backends must iterate in key
//! order. Two backends exist: an in-memory store for tests and
//! non-durable deployments, and a RocksDB store for production.
use crate::error::KvError;
use rocksdb::{DB, Direction, IteratorMode, Options};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

pub type KvResult<T> = std::result::Result<T, KvError>;

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> KvResult<()>;
    fn delete(&self, key: &str) -> KvResult<()>;
    /// All entries whose key starts with `prefix`, in ascending key order.
    fn iterate_prefix(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>>;
}

/// Non-durable store backed by an ordered map. State is lost on restart.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        Ok(self.entries.read().expect("kv lock").get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> KvResult<()> {
        self.entries
            .write()
            .expect("kv lock")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.entries.write().expect("kv lock").remove(key);
        Ok(())
    }

    fn iterate_prefix(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        let entries = self.entries.read().expect("kv lock");
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}

/// Durable store on RocksDB. Crash-safe to the granularity of a single
/// put or delete; no multi-key atomicity is offered or assumed.
pub struct RocksKv {
    db: DB,
}

impl RocksKv {
    pub fn open(path: impl AsRef<Path>) -> KvResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref()).map_err(|err| KvError::Open {
            path: path.as_ref().display().to_string(),
            message: err.to_string(),
        })?;
        Ok(Self { db })
    }
}

impl KvStore for RocksKv {
    fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        self.db
            .get(key.as_bytes())
            .map_err(|err| KvError::Io(err.to_string()))
    }

    fn put(&self, key: &str, value: &[u8]) -> KvResult<()> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|err| KvError::Io(err.to_string()))
    }

    fn delete(&self, key: &str) -> KvResult<()> {
        self.db
            .delete(key.as_bytes())
            .map_err(|err| KvError::Io(err.to_string()))
    }

    fn iterate_prefix(&self, prefix: &str) -> KvResult<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|err| KvError::Io(err.to_string()))?;
            let key = String::from_utf8_lossy(&key).into_owned();
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key, value.into_vec()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_store(store: &dyn KvStore) {
        store.put("es-1", b"stream-one").expect("put");
        store.put("es-2", b"stream-two").expect("put");
        store.put("sb-1", b"sub-one").expect("put");
        store.put("cp-es-1", b"checkpoint").expect("put");

        assert_eq!(store.get("es-1").expect("get"), Some(b"stream-one".to_vec()));
        assert_eq!(store.get("missing").expect("get"), None);

        let streams = store.iterate_prefix("es-").expect("iterate");
        assert_eq!(
            streams.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>(),
            vec!["es-1", "es-2"]
        );

        store.delete("es-1").expect("delete");
        assert_eq!(store.get("es-1").expect("get"), None);
        // Deleting a missing key is not an error.
        store.delete("es-1").expect("delete twice");
    }

    #[test]
    fn memory_store_roundtrip() {
        exercise_store(&MemoryKv::new());
    }

    #[test]
    fn rocks_store_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RocksKv::open(dir.path().join("db")).expect("open");
        exercise_store(&store);
    }

    #[test]
    fn rocks_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        {
            let store = RocksKv::open(&path).expect("open");
            store.put("es-persisted", b"payload").expect("put");
        }
        let store = RocksKv::open(&path).expect("reopen");
        assert_eq!(
            store.get("es-persisted").expect("get"),
            Some(b"payload".to_vec())
        );
    }

    #[test]
    fn rocks_open_bad_path_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("occupied");
        std::fs::write(&file, b"not a database").expect("write");
        assert!(matches!(
            RocksKv::open(&file),
            Err(KvError::Open { .. })
        ));
    }
}
