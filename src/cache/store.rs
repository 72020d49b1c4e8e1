//! Entry store implementations.
//!
//! `FsEntryStore` persists one file per entry under `<root>/<prefix>/<rest>`
//! and uses the file modification time as the write timestamp.
//! `MemoryEntryStore` keeps entries in a map and suits tests and
//! single-process deployments that do not need persistence.

use std::collections::HashMap;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::{fs, io::AsyncReadExt};

use super::keys::EntryKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

/// A stored response body and the instant it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedEntry {
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to {op} entry {key}: {source}")]
    Io {
        op: &'static str,
        key: String,
        #[source]
        source: io::Error,
    },
    #[error("entry store task for {key} did not complete: {message}")]
    Task { key: String, message: String },
}

impl StoreError {
    fn io(op: &'static str, key: &EntryKey, source: io::Error) -> Self {
        Self::Io {
            op,
            key: key.to_string(),
            source,
        }
    }
}

/// Persistence for cached bodies.
///
/// `put` must be atomic for readers: a concurrent `get` on the same key sees
/// either the previous body or the new one, never a partial write.
/// `delete` is idempotent.
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn get(&self, key: &EntryKey) -> Result<Option<CachedEntry>, StoreError>;

    async fn put(
        &self,
        key: &EntryKey,
        body: Bytes,
        stored_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn delete(&self, key: &EntryKey) -> Result<(), StoreError>;
}

// ============================================================================
// Filesystem store
// ============================================================================

/// Directory-backed store sharded by the first byte of the key digest.
#[derive(Debug, Clone)]
pub struct FsEntryStore {
    root: PathBuf,
}

impl FsEntryStore {
    /// Open a store rooted at `root`, creating the directory if necessary.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, io::Error> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        if !root.is_dir() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the file backing `key`.
    pub fn path_for(&self, key: &EntryKey) -> PathBuf {
        let (prefix, rest) = key.shard();
        self.root.join(prefix).join(rest)
    }
}

#[async_trait]
impl EntryStore for FsEntryStore {
    async fn get(&self, key: &EntryKey) -> Result<Option<CachedEntry>, StoreError> {
        let path = self.path_for(key);
        // Metadata and contents come from the same handle, so a concurrent
        // rename cannot pair one write's body with another's timestamp.
        let mut file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io("open", key, err)),
        };

        let metadata = file
            .metadata()
            .await
            .map_err(|err| StoreError::io("stat", key, err))?;
        let modified = metadata
            .modified()
            .map_err(|err| StoreError::io("stat", key, err))?;

        let mut body = Vec::with_capacity(usize::try_from(metadata.len()).unwrap_or_default());
        file.read_to_end(&mut body)
            .await
            .map_err(|err| StoreError::io("read", key, err))?;

        Ok(Some(CachedEntry {
            body: Bytes::from(body),
            stored_at: DateTime::<Utc>::from(modified),
        }))
    }

    async fn put(
        &self,
        key: &EntryKey,
        body: Bytes,
        stored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let owned_key = key.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &body, stored_at.into()))
            .await
            .map_err(|err| StoreError::Task {
                key: owned_key.to_string(),
                message: err.to_string(),
            })?
            .map_err(|err| StoreError::io("write", key, err))
    }

    /// Shard directories are left in place; a concurrent `put` for another
    /// key in the same shard may be about to create its temp file there.
    async fn delete(&self, key: &EntryKey) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io("delete", key, err)),
        }
    }
}

fn write_atomically(path: &Path, body: &[u8], stored_at: SystemTime) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "entry path has no parent"))?;
    std::fs::create_dir_all(dir)?;

    // The temp file lives next to the target so the rename never crosses
    // filesystems.
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(body)?;
    file.flush()?;
    file.as_file().set_modified(stored_at)?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process store. Writes replace the whole entry under a lock.
#[derive(Debug, Default)]
pub struct MemoryEntryStore {
    entries: RwLock<HashMap<EntryKey, CachedEntry>>,
}

impl MemoryEntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "memory_len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EntryStore for MemoryEntryStore {
    async fn get(&self, key: &EntryKey) -> Result<Option<CachedEntry>, StoreError> {
        Ok(rw_read(&self.entries, SOURCE, "memory_get").get(key).cloned())
    }

    async fn put(
        &self,
        key: &EntryKey,
        body: Bytes,
        stored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "memory_put")
            .insert(key.clone(), CachedEntry { body, stored_at });
        Ok(())
    }

    async fn delete(&self, key: &EntryKey) -> Result<(), StoreError> {
        rw_write(&self.entries, SOURCE, "memory_delete").remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Arc;

    use chrono::{SubsecRound, TimeZone};
    use tempfile::TempDir;

    use super::*;

    fn key(name: &str) -> EntryKey {
        EntryKey::digest(name)
    }

    fn instant() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 15, 10, 30, 0)
            .single()
            .expect("valid test instant")
    }

    #[tokio::test]
    async fn fs_put_then_get_round_trips_body_and_timestamp() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::new(dir.path()).expect("store");
        let key = key("example.com/");
        let body = Bytes::from_static(b"<html>\x00\xffbinary-safe</html>");

        store
            .put(&key, body.clone(), instant())
            .await
            .expect("put succeeds");

        let entry = store.get(&key).await.expect("get succeeds").expect("entry");
        assert_eq!(entry.body, body);
        assert_eq!(entry.stored_at.trunc_subsecs(0), instant());
    }

    #[tokio::test]
    async fn fs_entries_are_sharded_by_digest_prefix() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::new(dir.path()).expect("store");
        let key = key("example.com/sharded");
        let (prefix, rest) = key.shard();

        store
            .put(&key, Bytes::from_static(b"x"), instant())
            .await
            .expect("put succeeds");

        assert!(dir.path().join(prefix).join(rest).is_file());
        assert_eq!(store.path_for(&key), dir.path().join(prefix).join(rest));
    }

    #[tokio::test]
    async fn fs_get_missing_entry_is_none() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::new(dir.path()).expect("store");

        assert!(store.get(&key("absent")).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn fs_put_replaces_previous_body() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::new(dir.path()).expect("store");
        let key = key("example.com/replace");

        store
            .put(&key, Bytes::from_static(b"old"), instant())
            .await
            .expect("first put");
        store
            .put(&key, Bytes::from_static(b"new"), instant())
            .await
            .expect("second put");

        let entry = store.get(&key).await.expect("get").expect("entry");
        assert_eq!(entry.body, Bytes::from_static(b"new"));

        let (prefix, _) = key.shard();
        let files = std::fs::read_dir(dir.path().join(prefix))
            .expect("shard dir")
            .count();
        assert_eq!(files, 1, "temp files must not be left behind");
    }

    #[tokio::test]
    async fn fs_delete_is_idempotent_and_keeps_shard_dir() {
        let dir = TempDir::new().expect("temp dir");
        let store = FsEntryStore::new(dir.path()).expect("store");
        let key = key("example.com/delete");
        let (prefix, _) = key.shard();

        store.delete(&key).await.expect("delete absent key");

        store
            .put(&key, Bytes::from_static(b"body"), instant())
            .await
            .expect("put");
        store.delete(&key).await.expect("first delete");
        store.delete(&key).await.expect("second delete");

        assert!(store.get(&key).await.expect("get").is_none());
        assert!(dir.path().join(prefix).is_dir());
    }

    /// Two keys whose digests share the shard prefix.
    fn shard_siblings() -> (EntryKey, EntryKey) {
        let mut seen: HashMap<String, EntryKey> = HashMap::new();
        for n in 0.. {
            let candidate = key(&format!("example.com/sibling/{n}"));
            let prefix = candidate.shard().0.to_string();
            if let Some(first) = seen.remove(&prefix) {
                return (first, candidate);
            }
            seen.insert(prefix, candidate);
        }
        unreachable!("the prefix space is finite")
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fs_put_and_delete_on_shard_siblings_do_not_interfere() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(FsEntryStore::new(dir.path()).expect("store"));
        let (first, second) = shard_siblings();
        assert_eq!(first.shard().0, second.shard().0);

        let workers: Vec<_> = [first, second]
            .into_iter()
            .map(|key| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    for _ in 0..500 {
                        store
                            .put(&key, Bytes::from_static(b"sibling"), instant())
                            .await
                            .expect("put beside a concurrent delete");
                        store.delete(&key).await.expect("delete");
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.await.expect("worker task");
        }
    }

    #[tokio::test]
    async fn fs_concurrent_readers_never_see_partial_bodies() {
        let dir = TempDir::new().expect("temp dir");
        let store = Arc::new(FsEntryStore::new(dir.path()).expect("store"));
        let key = key("example.com/concurrent");
        let first = Bytes::from(vec![b'a'; 256 * 1024]);
        let second = Bytes::from(vec![b'b'; 256 * 1024]);

        store.put(&key, first.clone(), instant()).await.expect("seed");

        let writer = {
            let store = Arc::clone(&store);
            let key = key.clone();
            let (first, second) = (first.clone(), second.clone());
            tokio::spawn(async move {
                for round in 0..20 {
                    let body = if round % 2 == 0 { &second } else { &first };
                    store.put(&key, body.clone(), instant()).await.expect("put");
                }
            })
        };

        for _ in 0..50 {
            let entry = store.get(&key).await.expect("get").expect("entry");
            assert!(
                entry.body == first || entry.body == second,
                "observed a torn write of {} bytes",
                entry.body.len()
            );
        }

        writer.await.expect("writer task");
    }

    #[test]
    fn fs_store_rejects_file_root() {
        let dir = TempDir::new().expect("temp dir");
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"").expect("write file");

        assert!(FsEntryStore::new(&file).is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trip_and_delete() {
        let store = MemoryEntryStore::new();
        let key = key("example.com/memory");

        assert!(store.get(&key).await.expect("get").is_none());
        store
            .put(&key, Bytes::from_static(b"hello"), instant())
            .await
            .expect("put");

        let entry = store.get(&key).await.expect("get").expect("entry");
        assert_eq!(entry.body, Bytes::from_static(b"hello"));
        assert_eq!(entry.stored_at, instant());
        assert_eq!(store.len(), 1);

        store.delete(&key).await.expect("delete");
        store.delete(&key).await.expect("delete again");
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn memory_store_recovers_from_poisoned_lock() {
        let store = MemoryEntryStore::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store
            .put(&key("poisoned"), Bytes::from_static(b"ok"), instant())
            .await
            .expect("put");
        assert_eq!(store.len(), 1);
    }
}
