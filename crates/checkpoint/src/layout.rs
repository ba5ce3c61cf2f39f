//! Checkpoint directory naming and listing

use runtime_core::{Result, Step};
use storage::ScopedStorage;
use tracing::debug;

use crate::manifest::MANIFEST_FILE;

/// Prefix of every published checkpoint directory
pub const CHECKPOINT_PREFIX: &str = "checkpoint_";

/// Directory name of the checkpoint for `step`
pub fn checkpoint_dir_name(step: Step) -> String {
    format!("{}{}", CHECKPOINT_PREFIX, step)
}

/// Staging directory name for a save of `step` started at `timestamp`
pub fn staging_dir_name(step: Step, timestamp: i64) -> String {
    format!("{}.tmp-{}", checkpoint_dir_name(step), timestamp)
}

/// Step of a published checkpoint directory name
///
/// Staging directories and unrelated names yield `None`.
pub fn parse_checkpoint_dir(name: &str) -> Option<Step> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

/// Steps of every published checkpoint under `root`, ascending
///
/// A directory counts once its manifest has been written.
pub async fn all_steps(root: &ScopedStorage) -> Result<Vec<Step>> {
    let mut steps = Vec::new();
    for child in root.list_children("").await? {
        let Some(step) = parse_checkpoint_dir(&child) else {
            continue;
        };
        if root.exists(&format!("{}/{}", child, MANIFEST_FILE)).await? {
            steps.push(step);
        } else {
            debug!(dir = %child, "Ignoring checkpoint directory without manifest");
        }
    }
    steps.sort_unstable();
    Ok(steps)
}

pub async fn latest_step(root: &ScopedStorage) -> Result<Option<Step>> {
    Ok(all_steps(root).await?.last().copied())
}
