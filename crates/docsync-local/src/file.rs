use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::{KvStore, StoreError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};

const LOCK_FILE: &str = ".kvlock";

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    value: String,
    /// Wall-clock expiry in Unix milliseconds, comparable across processes.
    expires_at_ms: i64,
}

impl StoredEntry {
    fn remaining(&self, now_ms: i64) -> Option<Duration> {
        let left = self.expires_at_ms - now_ms;
        (left > 0).then(|| Duration::from_millis(left as u64))
    }
}

/// `KvStore` shared through a directory.
///
/// Every process pointing at the same directory (local disk or a shared
/// volume) sees the same entries. Each primitive runs under an exclusive
/// advisory lock on `<dir>/.kvlock`, which makes it atomic across processes.
///
/// Layout:
/// ```text
/// {dir}/
///   .kvlock                 # advisory lock file
///   {sha256(key)}.json      # {"value": ..., "expires_at_ms": ...}
/// ```
#[derive(Debug, Clone)]
pub struct FileKvStore {
    dir: Arc<PathBuf>,
}

impl FileKvStore {
    /// Create the store, creating `dir` if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Unavailable(format!("cannot create lock dir {}: {}", dir.display(), e))
        })?;
        debug!("file kv store at {}", dir.display());
        Ok(Self { dir: Arc::new(dir) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(dir: &Path, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        dir.join(format!("{}.json", hex::encode(digest)))
    }

    /// Run `op` on a blocking thread while holding the directory lock.
    async fn locked<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> Result<T, StoreError> + Send + 'static,
    {
        let dir = Arc::clone(&self.dir);
        tokio::task::spawn_blocking(move || {
            let lock_file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(dir.join(LOCK_FILE))
                .map_err(io_unavailable)?;
            lock_file.lock_exclusive().map_err(io_unavailable)?;
            let result = op(&dir);
            let _ = FileExt::unlock(&lock_file);
            result
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {}", e)))?
    }
}

fn io_unavailable(e: std::io::Error) -> StoreError {
    StoreError::Unavailable(format!("lock dir I/O error: {}", e))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn read_entry(path: &Path) -> Result<Option<StoredEntry>, StoreError> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_unavailable(e)),
    };
    serde_json::from_slice(&data).map(Some).map_err(|e| {
        StoreError::Serialization(format!("corrupt lock entry {}: {}", path.display(), e))
    })
}

fn write_entry(path: &Path, entry: &StoredEntry) -> Result<(), StoreError> {
    let json = serde_json::to_vec(entry).map_err(|e| StoreError::Serialization(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = File::create(&tmp).map_err(io_unavailable)?;
        std::io::Write::write_all(&mut file, &json).map_err(io_unavailable)?;
    }
    fs::rename(&tmp, path).map_err(io_unavailable)
}

fn remove_entry(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_unavailable(e)),
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self, value), level = "trace")]
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.locked(move |dir| {
            let path = Self::entry_path(dir, &key);
            let now = now_ms();
            if let Some(existing) = read_entry(&path)? {
                if existing.remaining(now).is_some() {
                    return Ok(false);
                }
            }
            write_entry(
                &path,
                &StoredEntry {
                    value,
                    expires_at_ms: now + ttl.as_millis() as i64,
                },
            )?;
            Ok(true)
        })
        .await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        self.locked(move |dir| {
            let path = Self::entry_path(dir, &key);
            match read_entry(&path)? {
                Some(entry) if entry.value == value && entry.remaining(now_ms()).is_some() => {
                    remove_entry(&path)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let key = key.to_string();
        self.locked(move |dir| {
            let path = Self::entry_path(dir, &key);
            Ok(read_entry(&path)?.and_then(|e| e.remaining(now_ms())))
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.remaining_ttl(key).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(30);

    fn setup() -> (FileKvStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FileKvStore::new(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_set_delete_cycle() {
        let (store, _temp_dir) = setup();

        assert!(store.set_if_absent("doc:ws:a", "t1", TTL).await.unwrap());
        assert!(!store.set_if_absent("doc:ws:a", "t2", TTL).await.unwrap());
        assert!(store.exists("doc:ws:a").await.unwrap());

        assert!(!store.delete_if_equals("doc:ws:a", "t2").await.unwrap());
        assert!(store.delete_if_equals("doc:ws:a", "t1").await.unwrap());
        assert!(!store.exists("doc:ws:a").await.unwrap());
    }

    #[tokio::test]
    async fn test_instances_share_directory() {
        let (first, temp_dir) = setup();
        let second = FileKvStore::new(temp_dir.path()).unwrap();

        assert!(first.set_if_absent("workspace:ws", "a", TTL).await.unwrap());
        assert!(!second.set_if_absent("workspace:ws", "b", TTL).await.unwrap());
        assert!(second.remaining_ttl("workspace:ws").await.unwrap().is_some());

        assert!(first.delete_if_equals("workspace:ws", "a").await.unwrap());
        assert!(second.set_if_absent("workspace:ws", "b", TTL).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entry_can_be_taken() {
        let (store, _temp_dir) = setup();

        store
            .set_if_absent("k", "old", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!store.exists("k").await.unwrap());
        assert!(store.set_if_absent("k", "new", TTL).await.unwrap());
        assert!(!store.delete_if_equals("k", "old").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_entry_reports_error() {
        let (store, temp_dir) = setup();
        let path = FileKvStore::entry_path(temp_dir.path(), "k");
        std::fs::write(&path, b"not json").unwrap();

        let err = store.exists("k").await.unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
