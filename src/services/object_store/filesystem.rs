//! Local-disk object store.
//!
//! Payloads are sharded beneath `root/{bucket}/{shard}/{shard}/{key}` and a
//! JSON record for each object (content type, size, etag) lives in a parallel
//! tree under `root/{bucket}/.meta/`. The record is written last and removed
//! first, so an object only exists once both halves are in place.

use super::{
    ByteStream, ListPage, ObjectStore, StoreError, StoreResult, StoredObject, paginate,
    validate_key,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use md5::Context;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const META_DIR: &str = ".meta";
const META_SUFFIX: &str = ".json";
const TMP_PREFIX: &str = ".tmp-";
const DEFAULT_PAGE_SIZE: usize = 1000;

/// Per-object record stored next to the payload.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct ObjectRecord {
    key: String,
    content_type: String,
    size_bytes: u64,
    etag: String,
    last_modified: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct FileSystemStore {
    /// Base directory on disk where buckets live.
    base_path: PathBuf,
    bucket: String,
    page_size: usize,
}

/// Removes a temp file if the write that owns it never completes.
struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or(Path::new(""))
    }

    fn disarm(&mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl FileSystemStore {
    pub fn new(base_path: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            bucket: bucket.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn bucket_root(&self) -> PathBuf {
        self.base_path.join(&self.bucket)
    }

    fn meta_root(&self) -> PathBuf {
        self.bucket_root().join(META_DIR)
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key) as hex.
    fn object_shards(&self, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", self.bucket, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        self.bucket_root().join(shard_a).join(shard_b).join(key)
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = self.object_shards(key);
        self.meta_root()
            .join(shard_a)
            .join(shard_b)
            .join(format!("{}{}", key, META_SUFFIX))
    }

    async fn read_record(&self, key: &str) -> StoreResult<ObjectRecord> {
        let raw = fs::read(self.record_path(key))
            .await
            .map_err(|err| not_found_or_io(err, key))?;
        serde_json::from_slice(&raw).map_err(|err| StoreError::Io(io::Error::other(err)))
    }

    /// Write `contents` to `path` through a temp file + rename.
    async fn write_atomically(&self, path: &Path, contents: &[u8]) -> StoreResult<()> {
        let parent = parent_dir(path)?;
        fs::create_dir_all(&parent).await?;
        let mut guard = TempFileGuard::new(parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4())));
        let mut file = File::create(guard.path()).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        fs::rename(guard.path(), path).await?;
        guard.disarm();
        Ok(())
    }

    /// Remove empty directories from `start` up to, but not including, `stop`.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    /// Every committed key, read from record file names (no file contents).
    async fn committed_keys(&self) -> StoreResult<Vec<String>> {
        let root = self.meta_root();
        let mut keys = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if let Some(key) = key_from_record_path(&root, &path) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl ObjectStore for FileSystemStore {
    /// Stream the body to a temp file, fsync, rename into place, then write
    /// the record. Partial writes never become visible.
    async fn put(&self, key: &str, mut body: ByteStream, content_type: &str) -> StoreResult<()> {
        validate_key(key)?;
        let file_path = self.object_path(key);
        let parent = parent_dir(&file_path)?;
        fs::create_dir_all(&parent).await?;

        let mut guard = TempFileGuard::new(parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4())));
        let mut file = File::create(guard.path()).await?;

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        fs::rename(guard.path(), &file_path).await?;
        guard.disarm();

        let record = ObjectRecord {
            key: key.to_string(),
            content_type: content_type.to_string(),
            size_bytes,
            etag: format!("{:x}", digest.compute()),
            last_modified: Utc::now(),
        };
        let raw = serde_json::to_vec(&record).map_err(io::Error::other)?;
        if let Err(err) = self.write_atomically(&self.record_path(key), &raw).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }

        debug!(key, size_bytes, etag = %record.etag, "stored object on disk");
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<StoredObject> {
        validate_key(key)?;
        let record = self.read_record(key).await?;
        let file = File::open(self.object_path(key))
            .await
            .map_err(|err| not_found_or_io(err, key))?;

        Ok(StoredObject {
            key: record.key,
            content_type: Some(record.content_type),
            size_bytes: Some(record.size_bytes),
            body: Box::pin(ReaderStream::new(file)),
        })
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        validate_key(key)?;
        let record_path = self.record_path(key);
        fs::remove_file(&record_path)
            .await
            .map_err(|err| not_found_or_io(err, key))?;

        let file_path = self.object_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }

        let bucket_root = self.bucket_root();
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        if let Some(parent) = record_path.parent() {
            self.prune_empty_dirs(parent, &self.meta_root()).await;
        }
        Ok(())
    }

    async fn list(
        &self,
        prefix: Option<&str>,
        continuation_token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let keys = self.committed_keys().await?;
        Ok(paginate(keys, prefix, continuation_token, self.page_size))
    }

    fn backend(&self) -> &'static str {
        "filesystem"
    }
}

fn parent_dir(path: &Path) -> StoreResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        StoreError::Io(io::Error::other("object path missing parent directory"))
    })
}

fn not_found_or_io(err: io::Error, key: &str) -> StoreError {
    if err.kind() == ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::Io(err)
    }
}

/// `.meta/{shard}/{shard}/{key}.json` back to `key`; temp files yield `None`.
fn key_from_record_path(meta_root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(meta_root).ok()?;
    let mut components = relative.components();
    components.next()?;
    components.next()?;
    let key_path = components.as_path().to_str()?;
    if key_path.rsplit('/').next()?.starts_with(TMP_PREFIX) {
        return None;
    }
    key_path.strip_suffix(META_SUFFIX).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::object_store::testing::{bytes_body, collect_body};

    fn store(dir: &tempfile::TempDir) -> FileSystemStore {
        FileSystemStore::new(dir.path(), "images")
    }

    #[tokio::test]
    async fn round_trips_payload_and_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        store.put("a.png", bytes_body(&payload), "image/png").await.unwrap();
        let object = store.get("a.png").await.unwrap();
        assert_eq!(object.content_type.as_deref(), Some("image/png"));
        assert_eq!(object.size_bytes, Some(payload.len() as u64));
        assert_eq!(collect_body(object.body).await, payload);
    }

    #[tokio::test]
    async fn overwrite_replaces_payload() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.put("a.png", bytes_body(b"one"), "image/png").await.unwrap();
        store.put("a.png", bytes_body(b"two"), "image/gif").await.unwrap();

        let object = store.get("a.png").await.unwrap();
        assert_eq!(object.content_type.as_deref(), Some("image/gif"));
        assert_eq!(collect_body(object.body).await, b"two");
    }

    #[tokio::test]
    async fn delete_removes_files_and_prunes_shards() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.put("a.png", bytes_body(b"x"), "image/png").await.unwrap();

        store.delete("a.png").await.unwrap();
        assert!(matches!(store.get("a.png").await, Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete("a.png").await, Err(StoreError::NotFound(_))));

        let (shard_a, _) = store.object_shards("a.png");
        assert!(!store.bucket_root().join(shard_a).exists());
    }

    #[tokio::test]
    async fn lists_nested_keys_in_order_across_pages() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir).with_page_size(2);
        for key in ["b.png", "a.png", "nested/c.png"] {
            store.put(key, bytes_body(b"x"), "image/png").await.unwrap();
        }

        let first = store.list(None, None).await.unwrap();
        assert_eq!(first.keys, vec!["a.png", "b.png"]);
        let second = store.list(None, first.next_token.as_deref()).await.unwrap();
        assert_eq!(second.keys, vec!["nested/c.png"]);
        assert!(second.next_token.is_none());

        let nested = store.list(Some("nested/"), None).await.unwrap();
        assert_eq!(nested.keys, vec!["nested/c.png"]);
    }

    #[tokio::test]
    async fn failed_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let body: ByteStream = Box::pin(futures::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"partial")),
            Err(io::Error::other("client went away")),
        ]));

        assert!(store.put("a.png", body, "image/png").await.is_err());
        assert!(matches!(store.get("a.png").await, Err(StoreError::NotFound(_))));
        assert!(store.list(None, None).await.unwrap().keys.is_empty());

        let (shard_a, shard_b) = store.object_shards("a.png");
        let shard_dir = store.bucket_root().join(shard_a).join(shard_b);
        let mut leftovers = std::fs::read_dir(shard_dir).unwrap();
        assert!(leftovers.next().is_none());
    }

    #[test]
    fn record_paths_map_back_to_keys() {
        let root = Path::new("/data/images/.meta");
        assert_eq!(
            key_from_record_path(root, Path::new("/data/images/.meta/ab/cd/x.png.json")),
            Some("x.png".to_string())
        );
        assert_eq!(
            key_from_record_path(root, Path::new("/data/images/.meta/ab/cd/dir/x.png.json")),
            Some("dir/x.png".to_string())
        );
        assert_eq!(
            key_from_record_path(root, Path::new("/data/images/.meta/ab/cd/.tmp-123")),
            None
        );
    }
}
