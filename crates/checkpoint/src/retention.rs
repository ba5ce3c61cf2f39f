//! Checkpoint retention policies
//!
//! After a checkpoint is published the primary host asks the configured
//! [`RetentionPolicy`] which published steps to delete. [`KeepLatest`] keeps
//! the most recent ones; [`KeepBest`] ranks by a metric read from an external
//! [`MetricLog`] and always keeps the newest checkpoint.

use async_trait::async_trait;
use parking_lot::Mutex;
use runtime_core::{Error, MetricMode, Result, Step};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides which published checkpoints to delete
#[async_trait]
pub trait RetentionPolicy: Send + Sync {
    /// Steps to delete, given every published step in ascending order
    async fn steps_to_remove(&self, steps: &[Step]) -> Result<Vec<Step>>;
}

/// Keep the `keep` most recent checkpoints; 0 keeps everything
#[derive(Debug, Clone, Copy)]
pub struct KeepLatest {
    pub keep: usize,
}

#[async_trait]
impl RetentionPolicy for KeepLatest {
    async fn steps_to_remove(&self, steps: &[Step]) -> Result<Vec<Step>> {
        if self.keep == 0 {
            return Ok(Vec::new());
        }
        let excess = steps.len().saturating_sub(self.keep);
        Ok(steps[..excess].to_vec())
    }
}

/// One scalar summary recorded by the training or evaluation loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    pub step: Step,
    pub tag: String,
    pub value: f64,
}

/// Queryable store of metric time series, grouped into runs
#[async_trait]
pub trait MetricLog: Send + Sync {
    async fn list_runs(&self) -> Result<BTreeSet<String>>;

    async fn events_for(&self, run: &str) -> Result<Vec<MetricEvent>>;
}

/// Metric log held in memory
#[derive(Debug, Default)]
pub struct InMemoryMetricLog {
    runs: Mutex<HashMap<String, Vec<MetricEvent>>>,
}

impl InMemoryMetricLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, run: &str, step: Step, tag: &str, value: f64) {
        self.runs
            .lock()
            .entry(run.to_string())
            .or_default()
            .push(MetricEvent {
                step,
                tag: tag.to_string(),
                value,
            });
    }
}

#[async_trait]
impl MetricLog for InMemoryMetricLog {
    async fn list_runs(&self) -> Result<BTreeSet<String>> {
        Ok(self.runs.lock().keys().cloned().collect())
    }

    async fn events_for(&self, run: &str) -> Result<Vec<MetricEvent>> {
        Ok(self.runs.lock().get(run).cloned().unwrap_or_default())
    }
}

/// Metric log read from JSON-lines files
///
/// Every directory below `root` holding `*.jsonl` files is a run, named by
/// its path relative to `root`. Each line is one [`MetricEvent`].
#[derive(Debug, Clone)]
pub struct JsonlMetricLog {
    root: PathBuf,
}

impl JsonlMetricLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn is_log_file(path: &std::path::Path) -> bool {
        path.extension().map(|ext| ext == "jsonl").unwrap_or(false)
    }
}

#[async_trait]
impl MetricLog for JsonlMetricLog {
    async fn list_runs(&self) -> Result<BTreeSet<String>> {
        let mut runs = BTreeSet::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if Self::is_log_file(&path) && dir != self.root {
                    if let Ok(relative) = dir.strip_prefix(&self.root) {
                        runs.insert(relative.to_string_lossy().replace('\\', "/"));
                    }
                }
            }
        }
        Ok(runs)
    }

    async fn events_for(&self, run: &str) -> Result<Vec<MetricEvent>> {
        let dir = self.root.join(run);
        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if Self::is_log_file(&entry.path()) {
                files.push(entry.path());
            }
        }
        files.sort();

        let mut events = Vec::new();
        for file in files {
            let contents = tokio::fs::read_to_string(&file).await?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<MetricEvent>(line) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!(
                        file = %file.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping malformed metric line"
                    ),
                }
            }
        }
        Ok(events)
    }
}

/// Keep the `keep` checkpoints with the best metric, plus the latest one
///
/// A `keep` of 0 keeps everything.
pub struct KeepBest {
    keep: usize,
    metric_name: String,
    mode: MetricMode,
    keep_without_metrics: bool,
    log: Arc<dyn MetricLog>,
    resolved: Mutex<Option<(String, String)>>,
}

impl KeepBest {
    /// `metric_name` has the form `<run>/<tag>`, where the run part may
    /// itself contain `/`.
    pub fn new(
        keep: usize,
        metric_name: impl Into<String>,
        mode: MetricMode,
        keep_without_metrics: bool,
        log: Arc<dyn MetricLog>,
    ) -> Self {
        let metric_name = metric_name.into();
        info!(keep, ?mode, metric = %metric_name, "Keeping best checkpoints by metric");
        Self {
            keep,
            metric_name,
            mode,
            keep_without_metrics,
            log,
            resolved: Mutex::new(None),
        }
    }

    /// Split the metric name into a run known to the log and a tag
    ///
    /// The longest run prefix present in the log wins. The split is cached
    /// once found.
    async fn run_and_tag(&self) -> Result<Option<(String, String)>> {
        let cached = self.resolved.lock().clone();
        if cached.is_some() {
            return Ok(cached);
        }

        let runs = self.log.list_runs().await?;
        let parts: Vec<&str> = self.metric_name.split('/').collect();
        let found = (1..parts.len()).rev().find_map(|i| {
            let run = parts[..i].join("/");
            runs.contains(&run).then(|| {
                let tag = self.metric_name[run.len() + 1..].to_string();
                (run, tag)
            })
        });

        if let Some((run, tag)) = &found {
            debug!(run = %run, tag = %tag, "Resolved metric run");
            *self.resolved.lock() = found.clone();
        }
        Ok(found)
    }

    async fn metrics_for_steps(&self, steps: &[Step]) -> Result<HashMap<Step, f64>> {
        let Some((run, tag)) = self.run_and_tag().await? else {
            warn!(metric = %self.metric_name, "No metric run matches; ranking without metrics");
            return Ok(HashMap::new());
        };

        let wanted: BTreeSet<Step> = steps.iter().copied().collect();
        Ok(self
            .log
            .events_for(&run)
            .await?
            .into_iter()
            .filter(|event| event.tag == tag && wanted.contains(&event.step))
            .map(|event| (event.step, event.value))
            .collect())
    }
}

#[async_trait]
impl RetentionPolicy for KeepBest {
    async fn steps_to_remove(&self, steps: &[Step]) -> Result<Vec<Step>> {
        // The latest checkpoint is kept on top of `keep`.
        if self.keep == 0 || steps.len() <= self.keep + 1 {
            return Ok(Vec::new());
        }

        let metrics = self.metrics_for_steps(steps).await?;
        info!(?metrics, "Collected checkpoint metrics");

        let Some((_latest, older)) = steps.split_last() else {
            return Err(Error::Internal {
                message: "empty step list".to_string(),
            });
        };
        let mut candidates: Vec<Step> = if self.keep_without_metrics {
            older.iter().copied().filter(|s| metrics.contains_key(s)).collect()
        } else {
            older.to_vec()
        };

        let to_remove = candidates.len().saturating_sub(self.keep);
        if to_remove == 0 {
            return Ok(Vec::new());
        }

        // Missing values sort to the deletion end; equal values stay oldest first.
        let missing = match self.mode {
            MetricMode::Max => f64::NEG_INFINITY,
            MetricMode::Min => f64::INFINITY,
        };
        let value = |step: &Step| metrics.get(step).copied().unwrap_or(missing);
        candidates.sort_by(|a, b| match self.mode {
            MetricMode::Max => value(a).total_cmp(&value(b)),
            MetricMode::Min => value(b).total_cmp(&value(a)),
        });

        candidates.truncate(to_remove);
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn log_with(run: &str, values: &[(Step, f64)]) -> Arc<InMemoryMetricLog> {
        let log = Arc::new(InMemoryMetricLog::new());
        for &(step, value) in values {
            log.record(run, step, "accuracy", value);
        }
        log
    }

    #[tokio::test]
    async fn test_keep_latest() {
        let policy = KeepLatest { keep: 2 };
        assert_eq!(policy.steps_to_remove(&[1, 2, 3, 4, 5]).await.unwrap(), vec![1, 2, 3]);
        assert!(policy.steps_to_remove(&[1, 2]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keep_latest_bounds() {
        let steps = [1, 2, 3];
        let cases: [(usize, Vec<Step>); 4] = [(0, vec![]), (1, vec![1, 2]), (3, vec![]), (5, vec![])];
        for (keep, expected) in cases {
            let removed = KeepLatest { keep }.steps_to_remove(&steps).await.unwrap();
            assert_eq!(removed, expected, "keep = {}", keep);
        }
    }

    #[tokio::test]
    async fn test_keep_best_bounds() {
        let log = log_with("eval", &[(1, 0.2), (2, 0.9), (3, 0.5)]);
        let steps = [1, 2, 3, 4];
        let cases: [(usize, Vec<Step>); 5] =
            [(0, vec![]), (1, vec![1, 3]), (3, vec![]), (4, vec![]), (9, vec![])];
        for (keep, expected) in cases {
            let policy = KeepBest::new(keep, "eval/accuracy", MetricMode::Max, false, log.clone());
            let removed = policy.steps_to_remove(&steps).await.unwrap();
            assert_eq!(removed, expected, "keep = {}", keep);
        }
    }

    #[tokio::test]
    async fn test_keep_best_always_keeps_latest() {
        let log = log_with("eval", &[(1, 0.2), (2, 0.9)]);
        let policy = KeepBest::new(1, "eval/accuracy", MetricMode::Max, false, log);
        assert_eq!(policy.steps_to_remove(&[1, 2, 3]).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_keep_best_min_mode() {
        let log = log_with("eval", &[(1, 0.2), (2, 0.9), (3, 0.1), (4, 0.5)]);
        let policy = KeepBest::new(1, "eval/accuracy", MetricMode::Min, false, log);
        let mut removed = policy.steps_to_remove(&[1, 2, 3, 4, 5]).await.unwrap();
        removed.sort();
        assert_eq!(removed, vec![1, 2, 4]);
    }

    #[tokio::test]
    async fn test_missing_metrics_are_deleted_first() {
        let log = log_with("eval", &[(2, 0.5)]);
        let policy = KeepBest::new(1, "eval/accuracy", MetricMode::Max, false, log);
        // 1 and 3 have no value; oldest first among them
        assert_eq!(policy.steps_to_remove(&[1, 2, 3, 4]).await.unwrap(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_keep_checkpoints_without_metrics() {
        let log = log_with("eval", &[(2, 0.5), (3, 0.7)]);
        let policy = KeepBest::new(1, "eval/accuracy", MetricMode::Max, true, log);
        assert_eq!(policy.steps_to_remove(&[1, 2, 3, 4]).await.unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_nothing_removed_without_excess() {
        let log = log_with("eval", &[]);
        let policy = KeepBest::new(2, "eval/accuracy", MetricMode::Max, false, log);
        assert!(policy.steps_to_remove(&[1, 2, 3]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nested_run_names() {
        let log = Arc::new(InMemoryMetricLog::new());
        log.record("train", 1, "eval/loss", 9.0);
        log.record("train/eval", 1, "loss", 0.3);
        log.record("train/eval", 2, "loss", 0.1);
        let policy = KeepBest::new(1, "train/eval/loss", MetricMode::Min, false, log);
        assert_eq!(
            policy.run_and_tag().await.unwrap(),
            Some(("train/eval".to_string(), "loss".to_string()))
        );
        assert_eq!(policy.steps_to_remove(&[1, 2, 3]).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_jsonl_metric_log() {
        let dir = TempDir::new().unwrap();
        let run = dir.path().join("inference_eval");
        std::fs::create_dir_all(&run).unwrap();
        std::fs::create_dir_all(dir.path().join("checkpoint_10")).unwrap();
        std::fs::write(
            run.join("metrics.jsonl"),
            "{\"step\":10,\"tag\":\"accuracy\",\"value\":0.5}\nnot json\n\
             {\"step\":20,\"tag\":\"accuracy\",\"value\":0.7}\n",
        )
        .unwrap();

        let log = JsonlMetricLog::new(dir.path());
        let runs = log.list_runs().await.unwrap();
        assert_eq!(runs.into_iter().collect::<Vec<_>>(), vec!["inference_eval".to_string()]);

        let events = log.events_for("inference_eval").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].step, 20);
    }
}
