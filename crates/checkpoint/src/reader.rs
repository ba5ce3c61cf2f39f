//! Checkpoint restore protocol
//!
//! Restoring resolves a checkpoint directory, decodes its manifest, moves
//! every stored spec onto the backend the directory lives on, applies restore
//! transforms, and turns each leaf into a value: inline entries directly,
//! stored entries as lazy arrays that read only this host's region.

use futures::future::try_join_all;
use runtime_core::{
    CheckpointerConfig, DType, Error, LocalRegion, Result, StateDict, Step, TrainState, Value,
};
use std::ops::Range;
use std::sync::Arc;
use storage::{ChunkedArray, Location, ScopedStorage, StorageRouter};
use tracing::{debug, info, instrument, warn};

use crate::dataset::{dataset_checkpoint_name, DatasetIterator};
use crate::layout::{checkpoint_dir_name, latest_step};
use crate::manifest::{InlineValue, Manifest, ManifestEntry, MANIFEST_FILE};
use crate::param_info::{ParameterInfo, ParameterInfos};
use crate::partitioning::Partitioner;
use crate::storage_spec::{absolute_location, migrate_backend, Backend, StorageSpec};
use crate::transform::{apply_restore_transforms, RestoreTransform};

/// Which checkpoint to restore, and how
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Step under the checkpoints root
    pub step: Option<Step>,

    /// Checkpoint directory, or the manifest inside it
    pub path: Option<String>,

    /// Values used for leaves the checkpoint does not hold
    pub fallback_state: Option<StateDict<Value>>,

    /// Leave stored arrays unread until first access
    pub lazy_parameters: bool,

    /// Passed to restore transforms
    pub is_resuming: bool,
}

/// A located manifest
#[derive(Debug, Clone)]
pub struct ResolvedCheckpoint {
    /// Checkpoint directory
    pub dir: Location,

    /// Manifest object name inside `dir`
    pub manifest_file: String,
}

/// Locate the checkpoint selected by `step` or `path`
///
/// With neither, the latest published step under `root` is used.
pub async fn resolve_checkpoint(
    router: &StorageRouter,
    root: &ScopedStorage,
    step: Option<Step>,
    path: Option<&str>,
) -> Result<ResolvedCheckpoint> {
    match (step, path) {
        (Some(step), Some(path)) => Err(Error::AmbiguousRequest {
            message: format!("both step {} and path {} given", step, path),
        }),
        (None, Some(path)) => find_checkpoint(router, path).await,
        (step, None) => {
            let step = match step {
                Some(step) => step,
                None => latest_step(root).await?.ok_or_else(|| {
                    Error::not_found(format!("no checkpoints under {}", root.location()))
                })?,
            };
            let dir = checkpoint_dir_name(step);
            if !root.exists(&format!("{}/{}", dir, MANIFEST_FILE)).await? {
                return Err(Error::not_found(format!(
                    "no checkpoint for step {} under {}",
                    step,
                    root.location()
                )));
            }
            Ok(ResolvedCheckpoint {
                dir: root.location().join(&dir),
                manifest_file: MANIFEST_FILE.to_string(),
            })
        }
    }
}

/// Locate the manifest for a checkpoint directory or manifest file path
pub async fn find_checkpoint(router: &StorageRouter, path: &str) -> Result<ResolvedCheckpoint> {
    let location = Location::parse(path)?;
    let storage = router.open(&location).await?;
    if storage.exists(MANIFEST_FILE).await? {
        return Ok(ResolvedCheckpoint {
            dir: location,
            manifest_file: MANIFEST_FILE.to_string(),
        });
    }

    if let (Some(parent), Some(file)) = (location.parent(), location.file_name()) {
        let dir = router.open(&parent).await?;
        if dir.exists(&file).await? {
            return Ok(ResolvedCheckpoint {
                dir: parent,
                manifest_file: file,
            });
        }
    }
    Err(Error::not_found(format!("no checkpoint found at {}", path)))
}

/// Decode the manifest of `checkpoint`, with specs moved onto its backend
pub async fn read_manifest(router: &StorageRouter, checkpoint: &ResolvedCheckpoint) -> Result<Manifest> {
    let dir = router.open(&checkpoint.dir).await?;
    let bytes = dir.read(&checkpoint.manifest_file).await?;
    let path = checkpoint.dir.join(&checkpoint.manifest_file).to_string();
    let mut manifest = Manifest::decode(&path, &bytes)?;
    migrate_backend(&mut manifest.optimizer, Backend::for_location(&checkpoint.dir))?;
    debug!(%path, version = manifest.version, step = manifest.step, "Read manifest");
    Ok(manifest)
}

/// Collaborators a restore runs against
pub(crate) struct CheckpointReader<'a> {
    pub config: &'a CheckpointerConfig,
    pub router: &'a Arc<StorageRouter>,
    pub root: &'a ScopedStorage,
    pub partitioner: &'a dyn Partitioner,
    pub dataset: Option<&'a dyn DatasetIterator>,
}

impl CheckpointReader<'_> {
    #[instrument(skip_all, fields(step = ?options.step, path = ?options.path))]
    pub async fn restore(
        &self,
        template: &StateDict<Value>,
        infos: &ParameterInfos,
        options: RestoreOptions,
        transforms: &[RestoreTransform],
    ) -> Result<TrainState> {
        let checkpoint =
            resolve_checkpoint(self.router, self.root, options.step, options.path.as_deref())
                .await?;
        info!(dir = %checkpoint.dir, "Restoring checkpoint");

        let manifest = read_manifest(self.router, &checkpoint).await?;
        let mut ckpt = apply_restore_transforms(
            manifest.optimizer,
            template,
            options.is_resuming,
            transforms,
        )?;
        if let Some(fallback) = &options.fallback_state {
            ckpt = ckpt.intersect(template);
            debug!(fallback_keys = fallback.len(), "Restoring with fallback state");
        }

        let mut restored = StateDict::new();
        let mut not_restored = Vec::new();
        for (name, info) in infos {
            let Some(info) = info else {
                restored.insert(name.clone(), Value::Absent);
                continue;
            };
            let Some(entry) = ckpt.remove(name) else {
                if options
                    .fallback_state
                    .as_ref()
                    .map(|f| f.contains(name))
                    .unwrap_or(false)
                {
                    not_restored.push(name.clone());
                    continue;
                }
                return Err(Error::not_found(format!(
                    "checkpoint at {} has no value for `{}`",
                    checkpoint.dir, name
                )));
            };
            let expected = match self.config.restore_dtype {
                Some(DType::BFloat16) => Some(DType::BFloat16),
                _ => template.get(name).and_then(Value::dtype).or(info.dtype),
            };
            let value = self.leaf_value(name, entry, info, expected, &checkpoint.dir)?;
            restored.insert(name.clone(), value);
        }
        for extra in ckpt.keys() {
            warn!(key = %extra, "Checkpoint key has no counterpart in the target state");
        }

        if let Some(dtype) = self.config.restore_dtype {
            restored = restored.map(|_, value| value.cast_float(dtype));
        }
        if !options.lazy_parameters {
            restored = materialize_all(restored).await?;
        }

        info!(
            restored = restored.len(),
            not_restored = ?not_restored,
            "Restored keys"
        );
        if let Some(fallback) = options.fallback_state {
            restored = restored.merge(fallback);
        }

        if let Some(dataset) = self.dataset {
            let name = dataset_checkpoint_name(&self.partitioner.data_layout());
            let dir = self.router.open(&checkpoint.dir).await?;
            let snapshot = match dir.read(&name).await {
                Ok(snapshot) => snapshot,
                Err(Error::StoragePathNotFound { .. }) => {
                    return Err(Error::not_found(format!(
                        "dataset snapshot {} missing from {}",
                        name, checkpoint.dir
                    )))
                }
                Err(e) => return Err(e),
            };
            dataset.restore(snapshot)?;
            debug!(file = %name, "Restored dataset position");
        }

        if self.partitioner.params_on_devices() {
            if options.lazy_parameters {
                return Err(Error::invalid_config(
                    "lazy parameters cannot be moved to devices",
                ));
            }
            let axes = self.partitioner.mesh_axes(&restored)?;
            restored = self.partitioner.move_to_devices(restored, &axes)?;
        }

        Ok(TrainState::new(manifest.step, restored))
    }

    fn leaf_value(
        &self,
        name: &str,
        entry: ManifestEntry,
        info: &ParameterInfo,
        expected_dtype: Option<DType>,
        dir: &Location,
    ) -> Result<Value> {
        match entry {
            ManifestEntry::Absent => Ok(Value::Absent),
            ManifestEntry::Inline(InlineValue::Scalar(scalar)) => Ok(Value::Scalar(scalar)),
            ManifestEntry::Inline(InlineValue::Array(array)) => match &info.local_region {
                Some(region) if !region.is_full(array.shape()) => {
                    Ok(Value::Array(array.slice(&region.ranges(array.shape())?)?))
                }
                _ => Ok(Value::Array(array)),
            },
            ManifestEntry::Stored(spec) => {
                let region = info
                    .local_region
                    .clone()
                    .unwrap_or_else(|| LocalRegion::full(info.shape.len()));
                Ok(Value::Lazy(stored_leaf(
                    self.router.clone(),
                    name,
                    spec,
                    &info.shape,
                    &region,
                    expected_dtype,
                    dir,
                    self.config.file_io_concurrency,
                )?))
            }
        }
    }
}

/// Lazy handle reading this host's region of a stored leaf
#[allow(clippy::too_many_arguments)]
pub(crate) fn stored_leaf(
    router: Arc<StorageRouter>,
    name: &str,
    spec: StorageSpec,
    expected_shape: &[usize],
    region: &LocalRegion,
    expected_dtype: Option<DType>,
    dir: &Location,
    io_concurrency: usize,
) -> Result<runtime_core::LazyArray> {
    let ranges: Vec<Range<usize>> = region.ranges(expected_shape)?;
    let read_shape: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
    let location = absolute_location(dir, &spec)?;
    let stored_dtype = spec.metadata.dtype;
    // Legacy checkpoints hold bfloat16 data under a `<u2` dtype.
    let reinterpret_bf16 = stored_dtype == DType::U16;
    let read_dtype = if reinterpret_bf16 { DType::BFloat16 } else { stored_dtype };
    let dtype = match expected_dtype {
        Some(expected) if expected.is_float() && read_dtype.is_float() => expected,
        _ => read_dtype,
    };

    let name = name.to_string();
    let expected_shape = expected_shape.to_vec();
    Ok(runtime_core::LazyArray::new(read_shape, dtype, move || {
        let router = router.clone();
        let location = location.clone();
        let ranges = ranges.clone();
        let name = name.clone();
        let expected_shape = expected_shape.clone();
        async move {
            let storage = router.open(&location).await?;
            let array = ChunkedArray::open(storage, io_concurrency).await?;
            if array.shape() != expected_shape.as_slice() {
                return Err(Error::ShapeMismatch {
                    name,
                    expected: expected_shape,
                    actual: array.shape().to_vec(),
                });
            }
            let mut data = array.read_region(&ranges).await?;
            if reinterpret_bf16 {
                data = data.bitcast(DType::BFloat16)?;
            }
            if data.dtype() != dtype {
                data = data.cast(dtype);
            }
            Ok(data)
        }
    }))
}

/// Materialize every lazy leaf concurrently
pub(crate) async fn materialize_all(state: StateDict<Value>) -> Result<StateDict<Value>> {
    let leaves = state.into_iter().map(|(name, value)| async move {
        Ok::<_, Error>((name, value.materialize().await?))
    });
    Ok(try_join_all(leaves).await?.into_iter().collect())
}

/// Restore a checkpoint without a target structure
///
/// Every stored leaf is read whole. `remap` renames checkpoint keys
/// (`(pattern, replacement)` pairs) after `transforms` run.
pub async fn load_checkpoint(
    router: Arc<StorageRouter>,
    path: &str,
    step: Option<Step>,
    transforms: &[RestoreTransform],
    remap: &[(String, String)],
    restore_dtype: Option<DType>,
    lazy: bool,
) -> Result<TrainState> {
    let root = router.open_path(path).await?;
    let checkpoint = match step {
        Some(_) => resolve_checkpoint(&router, &root, step, None).await?,
        None => find_checkpoint(&router, path).await?,
    };
    let manifest = read_manifest(&router, &checkpoint).await?;
    let ckpt = apply_restore_transforms(manifest.optimizer, &StateDict::new(), false, transforms)?;
    let ckpt = crate::transform::rename_keys(ckpt, remap)?;

    let io_concurrency = CheckpointerConfig::default().file_io_concurrency;
    let mut state = StateDict::new();
    for (name, entry) in ckpt {
        let value = match entry {
            ManifestEntry::Absent => Value::Absent,
            ManifestEntry::Inline(InlineValue::Array(array)) => Value::Array(array),
            ManifestEntry::Inline(InlineValue::Scalar(scalar)) => Value::Scalar(scalar),
            ManifestEntry::Stored(spec) => {
                let info = ParameterInfo::full_read(name.clone(), spec.clone());
                let region = LocalRegion::full(info.shape.len());
                Value::Lazy(stored_leaf(
                    router.clone(),
                    &name,
                    spec,
                    &info.shape,
                    &region,
                    info.dtype,
                    &checkpoint.dir,
                    io_concurrency,
                )?)
            }
        };
        state.insert(name, value);
    }

    if let Some(dtype) = restore_dtype {
        state = state.map(|_, value| value.cast_float(dtype));
    }
    if !lazy {
        state = materialize_all(state).await?;
    }
    Ok(TrainState::new(manifest.step, state))
}
