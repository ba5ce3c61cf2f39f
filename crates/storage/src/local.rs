//! Local filesystem storage backend
//!
//! File writes go through a uniquely named temp file and a rename, so readers
//! never observe a partially written chunk or manifest. Directory renames map
//! onto `rename(2)` and are atomic.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use runtime_core::{Error, Result};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::StorageBackend;

fn io_error(op: &str, path: &str, e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::NotFound {
        Error::StoragePathNotFound {
            path: path.to_string(),
        }
    } else {
        Error::Storage {
            message: format!("Failed to {} {}: {}", op, path, e),
        }
    }
}

/// Local filesystem storage backend rooted at a directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    /// Hidden sibling of the target used for the write-then-rename
    fn temp_path(&self, full_path: &Path) -> PathBuf {
        let temp_name = format!(
            ".{}.{}.tmp",
            full_path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4()
        );
        full_path.with_file_name(temp_name)
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    #[instrument(skip(self), fields(backend = "local"))]
    async fn read(&self, path: &str) -> Result<Bytes> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path)
            .await
            .map_err(|e| io_error("read", path, e))?;
        debug!(?full_path, size_bytes = data.len(), "Read file");
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self, data), fields(backend = "local", size_bytes = data.len()))]
    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.resolve_path(path);
        let temp_path = self.temp_path(&full_path);
        let size = data.len() as u64;

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory for", path, e))?;
        }

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| io_error("create temp file for", path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| io_error("write", path, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync", path, e))?;

        fs::rename(&temp_path, &full_path)
            .await
            .map_err(|e| io_error("rename temp file onto", path, e))?;

        debug!(?full_path, size, "File written atomically");
        Ok(size)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete(&self, path: &str) -> Result<()> {
        fs::remove_file(self.resolve_path(path))
            .await
            .map_err(|e| io_error("delete", path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve_path(path)).await.is_ok())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let search_path = self.resolve_path(prefix);
        let mut results = Vec::new();

        let dir_to_scan = if search_path.is_dir() {
            search_path
        } else {
            match search_path.parent() {
                Some(parent) if parent.is_dir() => parent.to_path_buf(),
                _ => return Ok(results),
            }
        };

        let mut stack = vec![dir_to_scan];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(file_type) = entry.file_type().await else {
                    continue;
                };
                let entry_path = entry.path();
                if file_type.is_dir() {
                    stack.push(entry_path);
                } else if let Ok(relative) = entry_path.strip_prefix(&self.base_path) {
                    let relative = relative.to_string_lossy().to_string();
                    if relative.starts_with(prefix) {
                        results.push(relative);
                    }
                }
            }
        }

        results.sort();
        debug!(count = results.len(), "Listed files");
        Ok(results)
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve_path(path))
            .await
            .map_err(|e| io_error("create directory", path, e))
    }

    async fn dir_exists(&self, path: &str) -> Result<bool> {
        Ok(fs::metadata(self.resolve_path(path))
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(self.resolve_path(path)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", path, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list", path, e))?
        {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_dir(&self, path: &str) -> Result<()> {
        fs::remove_dir_all(self.resolve_path(path))
            .await
            .map_err(|e| io_error("delete directory", path, e))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn rename_dir(&self, from: &str, to: &str) -> Result<()> {
        let target = self.resolve_path(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory for", to, e))?;
        }
        fs::rename(self.resolve_path(from), &target)
            .await
            .map_err(|e| io_error("rename", from, e))
    }

    fn supports_atomic_rename(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = LocalStorage::new(temp_dir.path());
        (temp_dir, storage)
    }

    #[tokio::test]
    async fn test_write_and_read_nested() {
        let (_temp_dir, storage) = setup();
        let data = Bytes::from("chunk bytes");

        let written = storage.write("a/b/0.0", data.clone()).await.unwrap();
        assert_eq!(written, 11);
        assert_eq!(storage.read("a/b/0.0").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_missing_paths() {
        let (_temp_dir, storage) = setup();

        assert!(!storage.exists("missing").await.unwrap());
        assert!(matches!(
            storage.read("missing").await,
            Err(Error::StoragePathNotFound { .. })
        ));
        assert!(matches!(
            storage.delete("missing").await,
            Err(Error::StoragePathNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_prefix() {
        let (_temp_dir, storage) = setup();
        storage.write("ckpt/x/0", Bytes::from("1")).await.unwrap();
        storage.write("ckpt/y/0", Bytes::from("2")).await.unwrap();
        storage.write("other/z", Bytes::from("3")).await.unwrap();

        let listed = storage.list("ckpt/").await.unwrap();
        assert_eq!(listed, vec!["ckpt/x/0".to_string(), "ckpt/y/0".to_string()]);
        assert_eq!(storage.list("").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_directory_operations() {
        let (_temp_dir, storage) = setup();
        storage.create_dir("checkpoint_5.tmp-1").await.unwrap();
        storage
            .write("checkpoint_5.tmp-1/checkpoint", Bytes::from("m"))
            .await
            .unwrap();
        assert!(storage.dir_exists("checkpoint_5.tmp-1").await.unwrap());

        storage
            .rename_dir("checkpoint_5.tmp-1", "checkpoint_5")
            .await
            .unwrap();
        assert!(!storage.dir_exists("checkpoint_5.tmp-1").await.unwrap());
        assert_eq!(
            storage.list_children("").await.unwrap(),
            vec!["checkpoint_5".to_string()]
        );

        storage.delete_dir("checkpoint_5").await.unwrap();
        assert!(storage.list_children("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let (temp_dir, storage) = setup();
        storage.write("atomic", Bytes::from("data")).await.unwrap();

        let leftovers = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
