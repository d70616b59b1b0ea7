//! Object storage collaborator.
//!
//! Every call takes the tenant's storage prefix explicitly; the object
//! path is always `<prefix>/<key>`.

use crate::signing::{SignedUrl, UrlSigner};
use async_trait::async_trait;
use chrono::Utc;
use smriti_core::ServiceError;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Make sure the prefix exists before any object is written below it.
    async fn ensure_prefix(&self, prefix: &str) -> Result<(), ServiceError>;

    /// Create a new object. Never overwrites: an existing object at the
    /// same path fails with [`ServiceError::Conflict`].
    async fn put(&self, prefix: &str, key: &str, bytes: Vec<u8>) -> Result<(), ServiceError>;

    async fn get(&self, prefix: &str, key: &str) -> Result<Vec<u8>, ServiceError>;

    async fn exists(&self, prefix: &str, key: &str) -> Result<bool, ServiceError>;

    /// Remove a prefix and everything below it.
    async fn remove_prefix(&self, prefix: &str) -> Result<(), ServiceError>;

    async fn issue_signed_url(
        &self,
        prefix: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<SignedUrl, ServiceError>;

    /// Retrieve an object through a URL issued by `issue_signed_url`.
    async fn fetch_signed(&self, url: &str) -> Result<Vec<u8>, ServiceError>;
}

/// Join and validate `<prefix>/<key>`.
pub fn object_path(prefix: &str, key: &str) -> Result<String, ServiceError> {
    validate_segment_path(prefix, "prefix")?;
    validate_segment_path(key, "key")?;
    Ok(format!("{prefix}/{key}"))
}

fn validate_segment_path(path: &str, what: &str) -> Result<(), ServiceError> {
    let bad = path.is_empty()
        || path.starts_with('/')
        || path.ends_with('/')
        || path.contains('?')
        || path.split('/').any(|s| s.is_empty() || s == "." || s == "..");
    if bad {
        return Err(ServiceError::Rejected(format!("invalid {what}: {path:?}")));
    }
    Ok(())
}

/// Process-local object store with fault injection, for tests and local runs.
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    prefixes: Mutex<HashSet<String>>,
    /// Object paths whose reads fail with the given error.
    broken: Mutex<HashMap<String, ServiceError>>,
    fail_ensure_prefix: Mutex<Option<ServiceError>>,
    signer: UrlSigner,
}

impl MemoryStorage {
    pub fn new(signing_key: impl AsRef<[u8]>) -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            prefixes: Mutex::new(HashSet::new()),
            broken: Mutex::new(HashMap::new()),
            fail_ensure_prefix: Mutex::new(None),
            signer: UrlSigner::new("mem://objects", signing_key),
        }
    }

    /// Make every read of `<prefix>/<key>` fail with `error`.
    pub fn break_object(&self, prefix: &str, key: &str, error: ServiceError) {
        lock(&self.broken).insert(format!("{prefix}/{key}"), error);
    }

    /// Make the next `ensure_prefix` call fail with `error`.
    pub fn fail_next_ensure_prefix(&self, error: ServiceError) {
        *lock(&self.fail_ensure_prefix) = Some(error);
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        lock(&self.prefixes).contains(prefix)
    }

    pub fn prefix_count(&self) -> usize {
        lock(&self.prefixes).len()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, ServiceError> {
        if let Some(err) = lock(&self.broken).get(path) {
            return Err(err.clone());
        }
        lock(&self.objects)
            .get(path)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(path.to_string()))
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn ensure_prefix(&self, prefix: &str) -> Result<(), ServiceError> {
        validate_segment_path(prefix, "prefix")?;
        if let Some(err) = lock(&self.fail_ensure_prefix).take() {
            return Err(err);
        }
        lock(&self.prefixes).insert(prefix.to_string());
        Ok(())
    }

    async fn put(&self, prefix: &str, key: &str, bytes: Vec<u8>) -> Result<(), ServiceError> {
        let path = object_path(prefix, key)?;
        match lock(&self.objects).entry(path) {
            Entry::Occupied(e) => Err(ServiceError::Conflict(e.key().clone())),
            Entry::Vacant(e) => {
                e.insert(bytes);
                Ok(())
            }
        }
    }

    async fn get(&self, prefix: &str, key: &str) -> Result<Vec<u8>, ServiceError> {
        let path = object_path(prefix, key)?;
        self.read(&path)
    }

    async fn exists(&self, prefix: &str, key: &str) -> Result<bool, ServiceError> {
        let path = object_path(prefix, key)?;
        Ok(lock(&self.objects).contains_key(&path))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), ServiceError> {
        validate_segment_path(prefix, "prefix")?;
        let below = format!("{prefix}/");
        lock(&self.objects).retain(|path, _| !path.starts_with(&below));
        lock(&self.prefixes).remove(prefix);
        Ok(())
    }

    async fn issue_signed_url(
        &self,
        prefix: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<SignedUrl, ServiceError> {
        let path = object_path(prefix, key)?;
        if !lock(&self.objects).contains_key(&path) {
            return Err(ServiceError::NotFound(path));
        }
        self.signer.sign(&path, ttl, Utc::now())
    }

    async fn fetch_signed(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        let path = self.signer.verify(url, Utc::now())?;
        self.read(&path)
    }
}

/// Object store rooted at a local directory; prefixes map to directories.
pub struct FsStorage {
    root: PathBuf,
    signer: UrlSigner,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>, signing_key: impl AsRef<[u8]>) -> Self {
        Self {
            root: root.into(),
            signer: UrlSigner::new("file://smriti", signing_key),
        }
    }

    fn resolve(&self, prefix: &str, key: &str) -> Result<PathBuf, ServiceError> {
        Ok(self.root.join(object_path(prefix, key)?))
    }
}

fn io_error(path: &std::path::Path, e: std::io::Error) -> ServiceError {
    match e.kind() {
        std::io::ErrorKind::NotFound => ServiceError::NotFound(path.display().to_string()),
        std::io::ErrorKind::AlreadyExists => ServiceError::Conflict(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => {
            ServiceError::Rejected(format!("{}: {e}", path.display()))
        }
        _ => ServiceError::Transient(format!("{}: {e}", path.display())),
    }
}

#[async_trait]
impl ObjectStorage for FsStorage {
    async fn ensure_prefix(&self, prefix: &str) -> Result<(), ServiceError> {
        validate_segment_path(prefix, "prefix")?;
        let dir = self.root.join(prefix);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))
    }

    async fn put(&self, prefix: &str, key: &str, bytes: Vec<u8>) -> Result<(), ServiceError> {
        let path = self.resolve(prefix, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(parent, e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| io_error(&path, e))?;
        file.write_all(&bytes).await.map_err(|e| io_error(&path, e))?;
        file.flush().await.map_err(|e| io_error(&path, e))
    }

    async fn get(&self, prefix: &str, key: &str) -> Result<Vec<u8>, ServiceError> {
        let path = self.resolve(prefix, key)?;
        tokio::fs::read(&path).await.map_err(|e| io_error(&path, e))
    }

    async fn exists(&self, prefix: &str, key: &str) -> Result<bool, ServiceError> {
        let path = self.resolve(prefix, key)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<(), ServiceError> {
        validate_segment_path(prefix, "prefix")?;
        let dir = self.root.join(prefix);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(&dir, e)),
        }
    }

    async fn issue_signed_url(
        &self,
        prefix: &str,
        key: &str,
        ttl: Duration,
    ) -> Result<SignedUrl, ServiceError> {
        if !self.exists(prefix, key).await? {
            return Err(ServiceError::NotFound(object_path(prefix, key)?));
        }
        self.signer.sign(&object_path(prefix, key)?, ttl, Utc::now())
    }

    async fn fetch_signed(&self, url: &str) -> Result<Vec<u8>, ServiceError> {
        let path = self.signer.verify(url, Utc::now())?;
        let full = self.root.join(&path);
        tokio::fs::read(&full).await.map_err(|e| io_error(&full, e))
    }
}
