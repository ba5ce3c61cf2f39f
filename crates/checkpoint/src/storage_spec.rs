//! Storage specs for stored leaves
//!
//! A [`StorageSpec`] says where a stored leaf lives and how it is laid out.
//! Specs in a manifest are relative to the checkpoint directory, so a
//! checkpoint can be moved or copied between roots and backends. They are
//! made absolute only when an array is opened.

use serde::{Deserialize, Serialize};
use std::path::Path;

use runtime_core::{Error, Result, StateDict};
use storage::{is_object_store_path, ArrayMetadata, Location};

use crate::manifest::ManifestEntry;

/// Array container every stored leaf uses
pub const CHUNKED_DRIVER: &str = "chunked";

/// Bucket written into relative object-store specs until resolution
pub const PLACEHOLDER_BUCKET: &str = "ckpt-placeholder-bucket";

/// Key-value store kind under an array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvDriver {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "object-store")]
    ObjectStore,
    #[serde(rename = "other")]
    Other(String),
}

/// Key-value store location of an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvStore {
    pub driver: KvDriver,
    pub path: String,
    pub bucket: Option<String>,
}

/// Descriptor of a stored leaf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSpec {
    pub driver: String,
    pub kvstore: KvStore,
    pub metadata: ArrayMetadata,
}

/// Storage backend family of a checkpoint root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    LocalFile,
    ObjectStore,
}

impl Backend {
    /// Backend implied by the syntax of a root path
    pub fn for_root(root: &str) -> Self {
        if is_object_store_path(root) {
            Backend::ObjectStore
        } else {
            Backend::LocalFile
        }
    }

    pub fn for_location(location: &Location) -> Self {
        if location.is_object_store() {
            Backend::ObjectStore
        } else {
            Backend::LocalFile
        }
    }
}

impl StorageSpec {
    /// Spec for a leaf stored at `relative_path` below the checkpoint directory
    pub fn relative(backend: Backend, relative_path: String, metadata: ArrayMetadata) -> Self {
        let (driver, bucket) = match backend {
            Backend::LocalFile => (KvDriver::File, None),
            Backend::ObjectStore => (KvDriver::ObjectStore, Some(PLACEHOLDER_BUCKET.to_string())),
        };
        Self {
            driver: CHUNKED_DRIVER.to_string(),
            kvstore: KvStore {
                driver,
                path: relative_path,
                bucket,
            },
            metadata,
        }
    }
}

/// Rewrite a relative spec against `ckpt_dir`
///
/// Specs that are already absolute are left untouched.
pub fn resolve_absolute(ckpt_dir: &Location, spec: &mut StorageSpec) -> Result<()> {
    match (&spec.kvstore.driver, ckpt_dir) {
        (KvDriver::File, Location::Local(dir)) => {
            // Compared by path component: `run10/x` is not inside `run1`.
            let path = Path::new(&spec.kvstore.path);
            let already_absolute = path.is_absolute()
                || (!dir.as_os_str().is_empty() && path.starts_with(dir));
            if !already_absolute {
                spec.kvstore.path = dir.join(&spec.kvstore.path).to_string_lossy().to_string();
            }
            Ok(())
        }
        (KvDriver::ObjectStore, Location::Object { bucket, key, .. }) => {
            let placeholder = match spec.kvstore.bucket.as_deref() {
                None => true,
                Some(b) => b == PLACEHOLDER_BUCKET,
            };
            if placeholder {
                spec.kvstore.bucket = Some(bucket.clone());
                spec.kvstore.path = if key.is_empty() {
                    spec.kvstore.path.clone()
                } else {
                    format!("{}/{}", key, spec.kvstore.path)
                };
            }
            Ok(())
        }
        (driver, _) => Err(Error::invalid_spec(format!(
            "spec with driver {:?} cannot be resolved against {}",
            driver, ckpt_dir
        ))),
    }
}

/// Absolute location of the array described by a relative spec
pub fn absolute_location(ckpt_dir: &Location, spec: &StorageSpec) -> Result<Location> {
    let mut spec = spec.clone();
    resolve_absolute(ckpt_dir, &mut spec)?;
    match (ckpt_dir, spec.kvstore.bucket) {
        (Location::Local(_), _) => Ok(Location::Local(spec.kvstore.path.into())),
        (Location::Object { scheme, .. }, Some(bucket)) => Ok(Location::Object {
            scheme: scheme.clone(),
            bucket,
            key: spec.kvstore.path,
        }),
        (Location::Object { .. }, None) => Err(Error::invalid_spec("object-store spec without bucket")),
    }
}

/// Rewrite one relative spec to live on `target`
pub fn migrate_spec(spec: &mut StorageSpec, target: Backend) -> Result<()> {
    if spec.driver != CHUNKED_DRIVER {
        return Err(Error::invalid_spec(format!(
            "unsupported array driver `{}`",
            spec.driver
        )));
    }
    match (&spec.kvstore.driver, target) {
        (KvDriver::File, Backend::ObjectStore) => {
            spec.kvstore.driver = KvDriver::ObjectStore;
            spec.kvstore.bucket = Some(PLACEHOLDER_BUCKET.to_string());
        }
        (KvDriver::ObjectStore, Backend::LocalFile) => {
            spec.kvstore.driver = KvDriver::File;
            spec.kvstore.bucket = None;
        }
        (KvDriver::File, Backend::LocalFile) | (KvDriver::ObjectStore, Backend::ObjectStore) => {}
        (KvDriver::Other(name), _) => {
            return Err(Error::invalid_spec(format!(
                "cannot migrate key-value store `{}`",
                name
            )))
        }
    }
    Ok(())
}

/// Rewrite every stored spec of a manifest to live on `target`
pub fn migrate_backend(state: &mut StateDict<ManifestEntry>, target: Backend) -> Result<()> {
    for (_, entry) in state.iter_mut() {
        if let ManifestEntry::Stored(spec) = entry {
            migrate_spec(spec, target)?;
        }
    }
    Ok(())
}
