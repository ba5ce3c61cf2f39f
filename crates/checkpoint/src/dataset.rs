//! Dataset iterator collaborator

use bytes::Bytes;
use runtime_core::Result;

use crate::partitioning::DataLayout;

/// Input pipeline whose position is saved alongside the model
///
/// The snapshot is opaque to the checkpointer; it is stored as one object
/// per data shard inside the checkpoint directory.
pub trait DatasetIterator: Send + Sync {
    /// Serialize the current position
    fn save(&self) -> Result<Bytes>;

    /// Return to a previously saved position
    fn restore(&self, snapshot: Bytes) -> Result<()>;
}

/// Name of the snapshot object for a data shard
pub fn dataset_checkpoint_name(layout: &DataLayout) -> String {
    format!(
        "train_ds-{:03}-of-{:03}",
        layout.shard_id, layout.num_shards
    )
}
