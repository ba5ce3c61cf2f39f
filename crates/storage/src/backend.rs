//! Storage backend trait definition
//!
//! Defines the async interface that all storage backends must implement.
//! Object stores only need the five key operations; the directory
//! operations have object-store defaults built on top of them.

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::Result;
use std::collections::BTreeSet;
use tracing::debug;

/// Join two `/`-separated key fragments, skipping empty ones
pub(crate) fn join_key(prefix: &str, path: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    match (prefix.is_empty(), path.is_empty()) {
        (true, _) => path.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, path),
    }
}

fn dir_prefix(path: &str) -> String {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        String::new()
    } else {
        format!("{}/", path)
    }
}

/// Async trait for storage backends
///
/// Implementors provide basic CRUD operations for binary data,
/// supporting both local filesystem and remote storage (S3, etc.).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read data from the given path
    ///
    /// # Errors
    /// Returns `StoragePathNotFound` if the path doesn't exist
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Write data to the given path, returning the number of bytes written
    ///
    /// Creates parent directories if they don't exist.
    /// Uses atomic writes where possible (write to temp, then rename).
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Delete data at the given path
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// List all object paths under a given prefix
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Create a directory (no-op on object stores)
    async fn create_dir(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    /// Whether anything lives under `path`
    async fn dir_exists(&self, path: &str) -> Result<bool> {
        Ok(!self.list(&dir_prefix(path)).await?.is_empty())
    }

    /// Names of the immediate children of `path`
    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = dir_prefix(path);
        let children: BTreeSet<String> = self
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split('/').next())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
        Ok(children.into_iter().collect())
    }

    /// Recursively delete everything under `path`
    async fn delete_dir(&self, path: &str) -> Result<()> {
        let keys = self.list(&dir_prefix(path)).await?;
        debug!(path, count = keys.len(), "Deleting objects under prefix");
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }

    /// Move everything under `from` to `to`
    ///
    /// The default copies then deletes, so a failure part way leaves both
    /// prefixes partially populated.
    async fn rename_dir(&self, from: &str, to: &str) -> Result<()> {
        let from_prefix = dir_prefix(from);
        let keys = self.list(&from_prefix).await?;
        debug!(from, to, count = keys.len(), "Copying objects to new prefix");
        for key in &keys {
            let Some(rest) = key.strip_prefix(from_prefix.as_str()) else {
                continue;
            };
            let data = self.read(key).await?;
            self.write(&join_key(to, rest), data).await?;
        }
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Whether `rename_dir` is a single atomic operation
    fn supports_atomic_rename(&self) -> bool {
        false
    }
}
