//! Routing locations to storage backends
//!
//! A [`StorageRouter`] turns a [`Location`] into a [`ScopedStorage`]: a
//! backend plus the key prefix the location points at. Local paths get a
//! fresh [`LocalStorage`]; object-store buckets are connected once through
//! an [`ObjectStoreConnector`] and cached.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use runtime_core::{Error, Result};
use tracing::debug;

use crate::backend::join_key;
use crate::{LocalStorage, Location, MemoryStorage, StorageBackend};

/// Opens backends for object-store buckets
#[async_trait]
pub trait ObjectStoreConnector: Send + Sync {
    async fn connect(&self, scheme: &str, bucket: &str) -> Result<Arc<dyn StorageBackend>>;
}

/// Connector handing out in-memory buckets, created on first use
#[derive(Debug, Default)]
pub struct MemoryConnector {
    buckets: DashMap<String, MemoryStorage>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct handle on a bucket, for inspection
    pub fn bucket(&self, name: &str) -> MemoryStorage {
        self.buckets.entry(name.to_string()).or_default().clone()
    }
}

#[async_trait]
impl ObjectStoreConnector for MemoryConnector {
    async fn connect(&self, _scheme: &str, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
        Ok(Arc::new(self.bucket(bucket)))
    }
}

/// Resolves locations to backends
#[derive(Default)]
pub struct StorageRouter {
    connector: Option<Arc<dyn ObjectStoreConnector>>,
    buckets: DashMap<String, Arc<dyn StorageBackend>>,
}

impl fmt::Debug for StorageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageRouter")
            .field("object_store", &self.connector.is_some())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

impl StorageRouter {
    /// Router that only handles local paths
    pub fn local() -> Self {
        Self::default()
    }

    /// Router that connects object-store locations through `connector`
    pub fn with_connector(connector: Arc<dyn ObjectStoreConnector>) -> Self {
        Self {
            connector: Some(connector),
            buckets: DashMap::new(),
        }
    }

    /// Open the storage scoped at `location`
    pub async fn open(&self, location: &Location) -> Result<ScopedStorage> {
        match location {
            Location::Local(path) => Ok(ScopedStorage::new(
                Arc::new(LocalStorage::new(path)),
                "",
                location.clone(),
            )),
            Location::Object {
                scheme,
                bucket,
                key,
            } => {
                let backend = self.bucket(scheme, bucket).await?;
                Ok(ScopedStorage::new(backend, key, location.clone()))
            }
        }
    }

    /// Parse and open a location string
    pub async fn open_path(&self, path: &str) -> Result<ScopedStorage> {
        self.open(&Location::parse(path)?).await
    }

    async fn bucket(&self, scheme: &str, bucket: &str) -> Result<Arc<dyn StorageBackend>> {
        let cache_key = format!("{}://{}", scheme, bucket);
        if let Some(backend) = self.buckets.get(&cache_key) {
            return Ok(backend.clone());
        }

        let connector = self
            .connector
            .as_ref()
            .ok_or_else(|| Error::StorageUnavailable {
                backend: scheme.to_string(),
            })?;
        let backend = connector.connect(scheme, bucket).await?;
        debug!(%cache_key, "Connected object store bucket");
        Ok(self.buckets.entry(cache_key).or_insert(backend).clone())
    }
}

/// A backend restricted to the keys under one prefix
#[derive(Clone)]
pub struct ScopedStorage {
    backend: Arc<dyn StorageBackend>,
    prefix: String,
    location: Location,
}

impl fmt::Debug for ScopedStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedStorage")
            .field("location", &self.location.to_string())
            .finish()
    }
}

impl ScopedStorage {
    pub fn new(backend: Arc<dyn StorageBackend>, prefix: &str, location: Location) -> Self {
        Self {
            backend,
            prefix: prefix.trim_matches('/').to_string(),
            location,
        }
    }

    /// Location this scope points at
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Narrow the scope to `relative`
    pub fn scope(&self, relative: &str) -> ScopedStorage {
        Self {
            backend: self.backend.clone(),
            prefix: self.key(relative),
            location: self.location.join(relative),
        }
    }

    fn key(&self, path: &str) -> String {
        join_key(&self.prefix, path)
    }

    pub async fn read(&self, path: &str) -> Result<Bytes> {
        self.backend.read(&self.key(path)).await
    }

    pub async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        self.backend.write(&self.key(path), data).await
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.backend.delete(&self.key(path)).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.backend.exists(&self.key(path)).await
    }

    /// Object paths under `path`, relative to this scope
    pub async fn list(&self, path: &str) -> Result<Vec<String>> {
        let keys = self.backend.list(&self.key(path)).await?;
        if self.prefix.is_empty() {
            return Ok(keys);
        }
        let strip = format!("{}/", self.prefix);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(strip.as_str()).map(str::to_string))
            .collect())
    }

    pub async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        self.backend.list_children(&self.key(path)).await
    }

    pub async fn create_dir(&self, path: &str) -> Result<()> {
        self.backend.create_dir(&self.key(path)).await
    }

    pub async fn dir_exists(&self, path: &str) -> Result<bool> {
        self.backend.dir_exists(&self.key(path)).await
    }

    pub async fn delete_dir(&self, path: &str) -> Result<()> {
        self.backend.delete_dir(&self.key(path)).await
    }

    pub async fn rename_dir(&self, from: &str, to: &str) -> Result<()> {
        self.backend.rename_dir(&self.key(from), &self.key(to)).await
    }

    pub fn supports_atomic_rename(&self) -> bool {
        self.backend.supports_atomic_rename()
    }
}
