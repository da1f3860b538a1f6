//! Object-store seam for the lakehouse: bucket + key addressing over
//! put / get / prefix-list, with filesystem and in-memory backends.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ilake-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("storage failure for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    fn from_io(key: &str, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound { key: key.to_string() }
        } else {
            Self::Io { key: key.to_string(), source }
        }
    }
}

/// Bucket-scoped object storage. Keys use `/` separators; `list` is
/// recursive under the given prefix and returns keys in sorted order.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn bucket(&self) -> &str;
    fn object_uri(&self, key: &str) -> String;
}

/// Filesystem-backed store: one directory per bucket under a root.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
    bucket: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            bucket: bucket.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let mut path = self.root.join(&self.bucket);
        for part in key.split('/').filter(|p| !p.is_empty()) {
            path.push(part);
        }
        path
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    /// Writes through a temp file + rename so a reader never observes a
    /// partially written object.
    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        let path = self.key_path(key);
        let parent = match path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => self.root.clone(),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::from_io(key, err))?;

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|err| StoreError::from_io(key, err))?;
        file.write_all(&bytes)
            .await
            .map_err(|err| StoreError::from_io(key, err))?;
        file.flush()
            .await
            .map_err(|err| StoreError::from_io(key, err))?;
        drop(file);

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(StoreError::from_io(key, err))
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        fs::read(self.key_path(key))
            .await
            .map_err(|err| StoreError::from_io(key, err))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let base = self.root.join(&self.bucket);
        let mut keys = Vec::new();
        let mut pending = vec![base.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::from_io(prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| StoreError::from_io(prefix, err))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| StoreError::from_io(prefix, err))?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(relative) = path.strip_prefix(&base) {
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_uri(&self, key: &str) -> String {
        format!("file://{}", self.key_path(key).display())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    put_log: Vec<String>,
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    #[allow(dead_code)]
    content_type: String,
}

/// In-memory store used by tests; records the order of puts so callers
/// can assert write-ordering contracts.
#[derive(Debug)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Mutex<MemoryState>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Every key put so far, in write order (including overwrites).
    pub async fn put_log(&self) -> Vec<String> {
        self.state.lock().await.put_log.clone()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.objects.insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        state.put_log.push(key.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.state.lock().await;
        state
            .objects
            .get(key)
            .map(|object| object.bytes.clone())
            .ok_or_else(|| StoreError::NotFound { key: key.to_string() })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_uri(&self, key: &str) -> String {
        format!("mem://{}/{}", self.bucket, key)
    }
}
