//! Per-leaf storage layout
//!
//! A [`ParameterInfo`] fixes, for one leaf of the training state, whether it
//! is stored inline in the manifest or as a chunked array, and which region
//! of it this host owns. Infos are built once from the full state and reused
//! by every save and restore until the state's structure changes.

use std::sync::Arc;

use runtime_core::{
    CheckpointerConfig, Compressor, DType, LocalRegion, Result, StateDict, Value,
};
use storage::ArrayMetadata;
use tracing::debug;

use crate::chunk::choose_chunk_shape;
use crate::partitioning::Partitioner;
use crate::storage_spec::{Backend, StorageSpec};

/// Storage layout of one leaf
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterInfo {
    pub name: String,

    /// Full (unsharded) shape; empty for scalars
    pub shape: Vec<usize>,

    /// Dtype the leaf is saved with; `None` for scalars
    pub dtype: Option<DType>,

    /// Where the leaf is stored; `None` stores it inline in the manifest
    pub storage_spec: Option<StorageSpec>,

    /// Part of the leaf held by this host
    pub local_region: Option<LocalRegion>,
}

impl ParameterInfo {
    /// Inline leaf
    pub fn inline(name: impl Into<String>, shape: Vec<usize>, dtype: Option<DType>) -> Self {
        Self {
            name: name.into(),
            shape,
            dtype,
            storage_spec: None,
            local_region: None,
        }
    }

    /// Info reading a stored leaf whole, as recorded in a manifest
    pub fn full_read(name: impl Into<String>, spec: StorageSpec) -> Self {
        let shape = spec.metadata.shape.clone();
        Self {
            name: name.into(),
            dtype: Some(spec.metadata.dtype),
            local_region: Some(LocalRegion::full(shape.len())),
            shape,
            storage_spec: Some(spec),
        }
    }

    pub fn is_inline(&self) -> bool {
        self.storage_spec.is_none()
    }
}

/// Infos for a whole state; `None` marks an absent leaf
pub type ParameterInfos = StateDict<Option<ParameterInfo>>;

/// Builds [`ParameterInfos`] from a template state
pub struct ParameterInfoBuilder {
    checkpoints_dir: String,
    save_dtype: DType,
    desired_chunk_bytes: u64,
    compressor: Compressor,
    partitioner: Arc<dyn Partitioner>,
}

impl ParameterInfoBuilder {
    pub fn new(config: &CheckpointerConfig, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            checkpoints_dir: config.checkpoints_dir.clone(),
            save_dtype: config.save_dtype,
            desired_chunk_bytes: config.desired_chunk_bytes,
            compressor: config.compressor,
            partitioner,
        }
    }

    pub fn build(&self, state: &StateDict<Value>) -> Result<ParameterInfos> {
        let axes = self.partitioner.mesh_axes(state)?;
        let backend = Backend::for_root(&self.checkpoints_dir);

        state
            .iter()
            .map(|(name, value)| {
                let info = match value {
                    Value::Absent => None,
                    Value::Scalar(_) => Some(ParameterInfo::inline(name.clone(), Vec::new(), None)),
                    Value::Array(_) | Value::Lazy(_) => {
                        let shape = value.shape().unwrap_or_default().to_vec();
                        let native = value.dtype().unwrap_or(DType::F32);
                        let dtype = if native.is_float() { self.save_dtype } else { native };

                        match axes.get(name).and_then(|a| a.as_ref()) {
                            None => Some(ParameterInfo::inline(name.clone(), shape, Some(dtype))),
                            Some(spec) => {
                                Some(self.stored(name, shape, dtype, spec, backend)?)
                            }
                        }
                    }
                };
                Ok((name.clone(), info))
            })
            .collect::<Result<StateDict<_>>>()
    }

    fn stored(
        &self,
        name: &str,
        shape: Vec<usize>,
        dtype: DType,
        axes: &crate::partitioning::PartitionSpec,
        backend: Backend,
    ) -> Result<ParameterInfo> {
        let region = self.partitioner.local_region(&shape, axes)?;
        let write_shape = region.write_shape(&shape)?;
        let target_elements = (self.desired_chunk_bytes / dtype.itemsize() as u64).max(1) as usize;
        let chunks = choose_chunk_shape(&write_shape, target_elements)?;
        debug!(leaf = name, ?shape, ?write_shape, ?chunks, "Chose chunk shape");

        let metadata = ArrayMetadata::new(shape.clone(), chunks, dtype, self.compressor)?;
        Ok(ParameterInfo {
            name: name.to_string(),
            shape,
            dtype: Some(dtype),
            storage_spec: Some(StorageSpec::relative(backend, name.replace('/', "."), metadata)),
            local_region: Some(region),
        })
    }
}
