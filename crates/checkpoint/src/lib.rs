//! Checkpoint management for distributed training
//!
//! Saves and restores sharded training state across hosts. Each host writes
//! the array regions it owns into chunked arrays; the primary host writes a
//! manifest and publishes the checkpoint directory atomically. Old
//! checkpoints are pruned by recency or by a monitored metric.
//!
//! # Example
//!
//! ```no_run
//! use checkpoint::{Checkpointer, RestoreOptions};
//! use runtime_core::{CheckpointerConfig, NdArray, StateDict, TrainState, Value};
//!
//! # async fn example() -> runtime_core::Result<()> {
//! let mut state = StateDict::new();
//! state.insert("target/dense/kernel", Value::Array(NdArray::from_vec(vec![2], vec![1f32, 2.])?));
//!
//! let checkpointer = Checkpointer::builder(CheckpointerConfig::new("/tmp/run/checkpoints"))
//!     .build(state.clone())
//!     .await?;
//! checkpointer.save(&TrainState::new(100, state), &[], None).await?;
//! let restored = checkpointer.restore(RestoreOptions::default(), &[]).await?;
//! assert_eq!(restored.step, 100);
//! # Ok(())
//! # }
//! ```

pub mod budget;
pub mod chunk;
pub mod coordination;
pub mod dataset;
pub mod foreign;
pub mod layout;
pub mod manager;
pub mod manifest;
pub mod param_info;
pub mod partitioning;
pub mod reader;
pub mod retention;
pub mod storage_spec;
pub mod transform;
mod writer;

pub use budget::{BytePermit, ByteBudget};
pub use chunk::choose_chunk_shape;
pub use coordination::{ClusterMember, HostCoordinator, LocalCluster, SingleHost};
pub use dataset::DatasetIterator;
pub use foreign::{parse_safetensors, CheckpointTranslator, RegexTranslator};
pub use layout::{checkpoint_dir_name, CHECKPOINT_PREFIX};
pub use manager::{Checkpointer, CheckpointerBuilder};
pub use manifest::{InlineValue, Manifest, ManifestEntry, MANIFEST_FILE};
pub use param_info::{ParameterInfo, ParameterInfoBuilder, ParameterInfos};
pub use partitioning::{AxisRule, DataLayout, MeshPartitioner, PartitionSpec, Partitioner};
pub use reader::{load_checkpoint, RestoreOptions};
pub use retention::{
    InMemoryMetricLog, JsonlMetricLog, KeepBest, KeepLatest, MetricEvent, MetricLog,
    RetentionPolicy,
};
pub use storage_spec::{Backend, StorageSpec};
pub use transform::{assignment_map, rename_keys, RestoreTransform, SaveTransform};
pub use writer::SaveOutcome;
