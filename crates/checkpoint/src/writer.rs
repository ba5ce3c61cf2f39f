//! Checkpoint save protocol
//!
//! Every host runs [`CheckpointWriter::save`] for the same step:
//!
//! 1. agree on a staging directory name (timestamp broadcast from host 0)
//!    and skip if the step is already published
//! 2. host 0 creates the staging directory; all hosts meet at a barrier
//! 3. each host writes the regions it owns (replica 0 only), gated by a
//!    byte budget, plus its dataset snapshot
//! 4. all hosts meet at a second barrier
//! 5. host 0 writes the manifest, promotes the directory and prunes old
//!    checkpoints
//!
//! A step counts as published once `checkpoint_<step>/checkpoint` exists.
//! On backends without an atomic rename the manifest is written after the
//! copy, so a promotion cut short is neither listed nor skipped on retry.
//!
//! A failed save leaves its staging directory behind; a retry stages anew.

use chrono::Utc;
use futures::future::try_join_all;
use runtime_core::{
    num_elements, CheckpointerConfig, DType, Error, LocalRegion, NdArray, Result, StateDict,
    Step, Value,
};
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;
use storage::{ChunkedArray, Location, ScopedStorage, StorageRouter};
use tracing::{debug, error, info, instrument, warn};

use crate::budget::ByteBudget;
use crate::coordination::HostCoordinator;
use crate::dataset::{dataset_checkpoint_name, DatasetIterator};
use crate::layout::{all_steps, checkpoint_dir_name, staging_dir_name};
use crate::manifest::{InlineValue, Manifest, ManifestEntry, MANIFEST_FILE};
use crate::param_info::{ParameterInfo, ParameterInfos};
use crate::partitioning::Partitioner;
use crate::retention::RetentionPolicy;
use crate::storage_spec::absolute_location;
use crate::transform::{apply_save_transforms, SaveTransform};

/// What a save call did on this host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The step was already published
    Skipped { step: Step },

    /// This host's share was written; another host publishes
    Written { step: Step },

    /// The checkpoint was published by this host
    Published { step: Step, deleted: Vec<Step> },
}

/// Collaborators a save runs against
pub(crate) struct CheckpointWriter<'a> {
    pub config: &'a CheckpointerConfig,
    pub router: &'a Arc<StorageRouter>,
    pub root: &'a ScopedStorage,
    pub coordinator: &'a dyn HostCoordinator,
    pub partitioner: &'a dyn Partitioner,
    pub dataset: Option<&'a dyn DatasetIterator>,
    pub retention: Option<&'a dyn RetentionPolicy>,
}

impl CheckpointWriter<'_> {
    #[instrument(skip_all, fields(step = step, host = self.coordinator.process_index()))]
    pub async fn save(
        &self,
        step: Step,
        state: StateDict<Value>,
        infos: ParameterInfos,
        transforms: &[SaveTransform],
        concurrent_bytes: Option<u64>,
    ) -> Result<SaveOutcome> {
        let result = self
            .save_inner(step, state, infos, transforms, concurrent_bytes)
            .await;
        if let Err(e) = &result {
            if e.is_fatal() {
                error!(step, error = %e, "Checkpoint save failed");
            } else {
                warn!(
                    step,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Checkpoint save failed; staging directory left behind"
                );
            }
        }
        result
    }

    async fn save_inner(
        &self,
        step: Step,
        state: StateDict<Value>,
        infos: ParameterInfos,
        transforms: &[SaveTransform],
        concurrent_bytes: Option<u64>,
    ) -> Result<SaveOutcome> {
        let start = Instant::now();
        let final_dir = checkpoint_dir_name(step);

        let timestamp = self
            .coordinator
            .broadcast_from_primary(
                &format!("checkpointer:timestamp:{}", final_dir),
                Utc::now().timestamp_millis(),
            )
            .await?;
        let tmp_dir = staging_dir_name(step, timestamp);

        let final_manifest = format!("{}/{}", final_dir, MANIFEST_FILE);
        if self.root.exists(&final_manifest).await? {
            info!(step, dir = %final_dir, "Checkpoint already exists, skipping save");
            return Ok(SaveOutcome::Skipped { step });
        }

        if self.coordinator.is_primary() {
            self.root.create_dir(&tmp_dir).await?;
            info!(step, dir = %tmp_dir, "Staging checkpoint");
        }
        self.barrier(&format!("checkpointer:make_dir:{}", tmp_dir)).await?;

        let (state, infos) = apply_save_transforms(state, infos, transforms)?;
        let save_dtype = self.config.save_dtype;
        let state = state.map(|_, value| value.cast_float(save_dtype));

        let budget = ByteBudget::new(concurrent_bytes.unwrap_or(self.config.concurrent_bytes));
        let tmp_location = self.root.location().join(&tmp_dir);

        let writes = state.into_iter().map(|(name, value)| {
            let info = infos.get(&name).cloned();
            let budget = budget.clone();
            let tmp_location = &tmp_location;
            async move {
                let info = info.ok_or_else(|| {
                    Error::invalid_spec(format!("no parameter info for leaf `{}`", name))
                })?;
                let entry = self.save_leaf(&name, value, info, &budget, tmp_location).await?;
                Ok::<_, Error>((name, entry))
            }
        });
        let entries: StateDict<ManifestEntry> = try_join_all(writes).await?.into_iter().collect();

        if let Some(dataset) = self.dataset {
            let layout = self.partitioner.data_layout();
            if layout.is_first_host_in_replica_set {
                let name = dataset_checkpoint_name(&layout);
                let size = self
                    .root
                    .write(&format!("{}/{}", tmp_dir, name), dataset.save()?)
                    .await?;
                debug!(file = %name, size_bytes = size, "Wrote dataset snapshot");
            }
        }

        self.barrier(&format!("checkpointer:write_complete:{}", tmp_dir))
            .await?;

        if !self.coordinator.is_primary() {
            return Ok(SaveOutcome::Written { step });
        }

        let manifest = Manifest::new(step, entries).encode()?;

        // Leftovers of an earlier promotion that never got its manifest.
        if self.root.dir_exists(&final_dir).await? {
            warn!(dir = %final_dir, "Removing unpublished checkpoint directory");
            self.root.delete_dir(&final_dir).await?;
        }

        if self.root.supports_atomic_rename() {
            let size = self
                .root
                .write(&format!("{}/{}", tmp_dir, MANIFEST_FILE), manifest)
                .await?;
            debug!(size_bytes = size, "Wrote manifest");
            self.root.rename_dir(&tmp_dir, &final_dir).await?;
        } else {
            warn!(from = %tmp_dir, to = %final_dir, "Backend has no atomic rename; promoting by copy");
            self.root.rename_dir(&tmp_dir, &final_dir).await?;
            let size = self.root.write(&final_manifest, manifest).await?;
            debug!(size_bytes = size, "Wrote manifest after copy");
        }
        info!(
            step,
            dir = %final_dir,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Published checkpoint"
        );

        let deleted = self.prune().await?;
        Ok(SaveOutcome::Published { step, deleted })
    }

    async fn barrier(&self, name: &str) -> Result<()> {
        let timeout = self.config.barrier_timeout;
        tokio::time::timeout(timeout, self.coordinator.barrier(name))
            .await
            .map_err(|_| Error::BarrierTimeout {
                barrier_id: name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    async fn prune(&self) -> Result<Vec<Step>> {
        let Some(policy) = self.retention else {
            return Ok(Vec::new());
        };
        let steps = all_steps(self.root).await?;
        let doomed = policy.steps_to_remove(&steps).await?;
        for step in &doomed {
            let dir = checkpoint_dir_name(*step);
            info!(step, dir = %dir, "Deleting checkpoint");
            self.root.delete_dir(&dir).await?;
        }
        Ok(doomed)
    }

    async fn save_leaf(
        &self,
        name: &str,
        value: Value,
        info: Option<ParameterInfo>,
        budget: &Arc<ByteBudget>,
        tmp_location: &Location,
    ) -> Result<ManifestEntry> {
        let Some(info) = info else {
            return Ok(ManifestEntry::Absent);
        };
        if value.is_absent() {
            return Ok(ManifestEntry::Absent);
        }

        let Some(spec) = info.storage_spec.clone() else {
            return match value.materialize().await? {
                Value::Array(array) => Ok(ManifestEntry::Inline(InlineValue::Array(array))),
                Value::Scalar(scalar) => Ok(ManifestEntry::Inline(InlineValue::Scalar(scalar))),
                _ => Ok(ManifestEntry::Absent),
            };
        };

        let region = info
            .local_region
            .clone()
            .unwrap_or_else(|| LocalRegion::full(info.shape.len()));
        let ranges = region.ranges(&info.shape)?;
        let write_shape: Vec<usize> = ranges.iter().map(|r| r.len()).collect();

        let actual = value.shape().map(<[usize]>::to_vec).unwrap_or_default();
        let needs_slice = if actual == write_shape {
            false
        } else if actual == info.shape {
            true
        } else {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: write_shape,
                actual,
            });
        };

        if region.replica_id != 0 {
            debug!(leaf = name, replica = region.replica_id, "Skipping replica write");
            return Ok(ManifestEntry::Stored(spec));
        }

        let nbytes = (num_elements(&write_shape)
            * spec.metadata.dtype.itemsize()) as u64;
        let _permit = budget.acquire(name, nbytes).await;

        let array = match value.materialize().await? {
            Value::Array(array) => array,
            _ => {
                return Err(Error::invalid_spec(format!(
                    "leaf `{}` has a storage spec but no array value",
                    name
                )))
            }
        };
        let local = local_block(array, needs_slice, &ranges, spec.metadata.dtype)?;

        let location = absolute_location(tmp_location, &spec)?;
        let storage = self.router.open(&location).await?;
        let stored =
            ChunkedArray::create(storage, spec.metadata.clone(), self.config.file_io_concurrency)
                .await?;
        let origin: Vec<usize> = ranges.iter().map(|r| r.start).collect();
        stored.write_region(&origin, &local).await?;
        debug!(leaf = name, size_bytes = nbytes, "Wrote leaf");

        Ok(ManifestEntry::Stored(spec))
    }
}

/// This host's block of `array`, in the stored dtype
fn local_block(
    array: NdArray,
    needs_slice: bool,
    ranges: &[Range<usize>],
    dtype: DType,
) -> Result<NdArray> {
    let local = if needs_slice { array.slice(ranges)? } else { array };
    if local.dtype() == dtype {
        Ok(local)
    } else {
        Ok(local.cast(dtype))
    }
}
