//! Checkpointer configuration types

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Compressor, DType, Error, Result};

/// Top-level configuration for a training job's checkpointing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Checkpointer settings
    pub checkpoint: CheckpointerConfig,

    /// Object store connection settings
    pub object_store: ObjectStoreConfig,
}

impl RuntimeConfig {
    /// Parse a JSON configuration document
    pub fn from_json(json: &str) -> Result<Self> {
        let config: RuntimeConfig = serde_json::from_str(json)?;
        config.checkpoint.validate()?;
        Ok(config)
    }
}

/// Checkpointer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointerConfig {
    /// Root under which `checkpoint_<step>` directories live
    pub checkpoints_dir: String,

    /// Number of checkpoints to keep (None or 0 keeps everything)
    pub keep: Option<usize>,

    /// Dtype floating point arrays are cast to before saving
    ///
    /// Applies to every floating point leaf of the state, optimizer slots
    /// included, not only the `target` subtree.
    pub save_dtype: DType,

    /// Dtype floating point arrays are cast to after restoring
    ///
    /// Like `save_dtype`, covers every floating point leaf.
    pub restore_dtype: Option<DType>,

    /// Bytes of array data allowed in flight during a save
    pub concurrent_bytes: u64,

    /// Target size of one stored chunk
    pub desired_chunk_bytes: u64,

    /// Codec applied to stored chunks
    pub compressor: Compressor,

    /// Concurrent chunk reads/writes per array
    pub file_io_concurrency: usize,

    /// How long a host waits at a save barrier
    #[serde(with = "humantime_serde")]
    pub barrier_timeout: Duration,

    /// Pruning policy applied after each save
    pub retention: RetentionConfig,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            checkpoints_dir: "./checkpoints".to_string(),
            keep: None,
            save_dtype: DType::F32,
            restore_dtype: None,
            concurrent_bytes: 128_000_000_000,
            desired_chunk_bytes: 64 * 1024 * 1024, // 64MiB
            compressor: Compressor::default(),
            file_io_concurrency: 128,
            barrier_timeout: Duration::from_secs(300),
            retention: RetentionConfig::default(),
        }
    }
}

impl CheckpointerConfig {
    /// Config rooted at `checkpoints_dir` with defaults elsewhere
    pub fn new(checkpoints_dir: impl Into<String>) -> Self {
        Self {
            checkpoints_dir: checkpoints_dir.into(),
            ..Default::default()
        }
    }

    /// Reject settings the checkpointer cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.checkpoints_dir.is_empty() {
            return Err(Error::invalid_config("checkpoints_dir must not be empty"));
        }
        if self.concurrent_bytes == 0 {
            return Err(Error::invalid_config("concurrent_bytes must be positive"));
        }
        if self.desired_chunk_bytes == 0 {
            return Err(Error::invalid_config("desired_chunk_bytes must be positive"));
        }
        if self.file_io_concurrency == 0 {
            return Err(Error::invalid_config("file_io_concurrency must be positive"));
        }
        if let RetentionConfig::BestMetric {
            metric_name_to_monitor,
            ..
        } = &self.retention
        {
            match metric_name_to_monitor.split_once('/') {
                Some((run, tag)) if !run.is_empty() && !tag.is_empty() => {}
                _ => {
                    return Err(Error::invalid_config(format!(
                        "metric name `{}` must have the form `<run>/<tag>`",
                        metric_name_to_monitor
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Checkpoint retention policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum RetentionConfig {
    /// Keep the most recent checkpoints
    #[default]
    Recency,

    /// Keep the checkpoints with the best value of an external metric
    BestMetric {
        /// `<run>/<tag>` of the metric to rank by
        metric_name_to_monitor: String,

        /// Whether larger or smaller values are better
        mode: MetricMode,

        /// Never delete checkpoints that have no metric value
        keep_checkpoints_without_metrics: bool,
    },
}

/// Ranking direction for metric-based retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricMode {
    Max,
    Min,
}

/// Object store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// AWS region
    pub region: String,

    /// Custom endpoint (for S3-compatible stores)
    pub endpoint_url: Option<String>,

    /// Use path-style addressing
    pub force_path_style: bool,

    /// Requests retried before an operation fails
    pub max_retries: u32,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            region: "us-east-1".to_string(),
            endpoint_url: None,
            force_path_style: false,
            max_retries: 3,
        }
    }
}

/// Duration serialization helper for human-readable formats
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.checkpoint.concurrent_bytes, 128_000_000_000);
        assert_eq!(config.checkpoint.desired_chunk_bytes, 64 * 1024 * 1024);
        assert_eq!(config.checkpoint.save_dtype, DType::F32);
        assert!(config.checkpoint.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let mut config = RuntimeConfig::default();
        config.checkpoint.keep = Some(3);
        config.checkpoint.retention = RetentionConfig::BestMetric {
            metric_name_to_monitor: "train/accuracy".to_string(),
            mode: MetricMode::Max,
            keep_checkpoints_without_metrics: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        let parsed = RuntimeConfig::from_json(&json).unwrap();
        assert_eq!(parsed.checkpoint.keep, Some(3));
        assert_eq!(parsed.checkpoint.barrier_timeout, Duration::from_secs(300));
        assert!(matches!(
            parsed.checkpoint.retention,
            RetentionConfig::BestMetric { mode: MetricMode::Max, .. }
        ));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = CheckpointerConfig::new("/tmp/ckpt");
        config.concurrent_bytes = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidConfig { .. })));

        let mut config = CheckpointerConfig::new("/tmp/ckpt");
        config.retention = RetentionConfig::BestMetric {
            metric_name_to_monitor: "accuracy".to_string(),
            mode: MetricMode::Min,
            keep_checkpoints_without_metrics: false,
        };
        assert!(config.validate().is_err());
    }
}
