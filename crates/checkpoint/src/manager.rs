//! Checkpointer facade
//!
//! A [`Checkpointer`] is built once per training job from a template of the
//! training state. It owns the parameter infos derived from that template and
//! the collaborators every save and restore runs against.

use runtime_core::{
    CheckpointerConfig, Error, Result, RetentionConfig, StateDict, Step, TrainState, Value,
};
use std::path::PathBuf;
use std::sync::Arc;
use storage::{is_object_store_path, ScopedStorage, StorageRouter};
use tracing::{debug, info};

use crate::coordination::{HostCoordinator, SingleHost};
use crate::dataset::DatasetIterator;
use crate::foreign::{foreign_step, read_foreign_checkpoint, restore_foreign, CheckpointTranslator};
use crate::layout;
use crate::param_info::{ParameterInfoBuilder, ParameterInfos};
use crate::partitioning::{MeshPartitioner, Partitioner};
use crate::reader::{CheckpointReader, RestoreOptions};
use crate::retention::{JsonlMetricLog, KeepBest, KeepLatest, MetricLog, RetentionPolicy};
use crate::transform::{RestoreTransform, SaveTransform};
use crate::writer::{CheckpointWriter, SaveOutcome};

/// Builder for [`Checkpointer`]
pub struct CheckpointerBuilder {
    config: CheckpointerConfig,
    router: Option<Arc<StorageRouter>>,
    coordinator: Option<Arc<dyn HostCoordinator>>,
    partitioner: Option<Arc<dyn Partitioner>>,
    dataset: Option<Arc<dyn DatasetIterator>>,
    metric_log: Option<Arc<dyn MetricLog>>,
}

impl CheckpointerBuilder {
    pub fn new(config: CheckpointerConfig) -> Self {
        Self {
            config,
            router: None,
            coordinator: None,
            partitioner: None,
            dataset: None,
            metric_log: None,
        }
    }

    /// Storage router (default: local paths only)
    pub fn router(mut self, router: Arc<StorageRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Host coordinator (default: a single host)
    pub fn coordinator(mut self, coordinator: Arc<dyn HostCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Partitioner (default: one host holding every array)
    pub fn partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = Some(partitioner);
        self
    }

    /// Input pipeline saved and restored with the model
    pub fn dataset(mut self, dataset: Arc<dyn DatasetIterator>) -> Self {
        self.dataset = Some(dataset);
        self
    }

    /// Metric source for best-metric retention
    ///
    /// Defaults to JSON-lines logs under a local checkpoints directory.
    pub fn metric_log(mut self, log: Arc<dyn MetricLog>) -> Self {
        self.metric_log = Some(log);
        self
    }

    pub async fn build(self, template: StateDict<Value>) -> Result<Checkpointer> {
        self.config.validate()?;

        let router = match self.router {
            Some(router) => router,
            None => Arc::new(StorageRouter::local()),
        };
        let coordinator: Arc<dyn HostCoordinator> = match self.coordinator {
            Some(coordinator) => coordinator,
            None => Arc::new(SingleHost),
        };
        let partitioner: Arc<dyn Partitioner> = match self.partitioner {
            Some(partitioner) => partitioner,
            None => Arc::new(MeshPartitioner::single_host()),
        };
        let root = router.open_path(&self.config.checkpoints_dir).await?;

        let retention = retention_policy(&self.config, self.metric_log)?;
        let parameter_infos =
            ParameterInfoBuilder::new(&self.config, partitioner.clone()).build(&template)?;

        info!(
            dir = %root.location(),
            host = coordinator.process_index(),
            hosts = coordinator.process_count(),
            leaves = parameter_infos.len(),
            "Checkpointer ready"
        );

        Ok(Checkpointer {
            config: self.config,
            router,
            root,
            coordinator,
            partitioner,
            dataset: self.dataset,
            retention,
            template,
            parameter_infos,
        })
    }
}

fn retention_policy(
    config: &CheckpointerConfig,
    metric_log: Option<Arc<dyn MetricLog>>,
) -> Result<Option<Arc<dyn RetentionPolicy>>> {
    // `keep` of 0 disables pruning like `None` does.
    let Some(keep) = config.keep.filter(|&keep| keep > 0) else {
        return Ok(None);
    };
    let policy: Arc<dyn RetentionPolicy> = match &config.retention {
        RetentionConfig::Recency => Arc::new(KeepLatest { keep }),
        RetentionConfig::BestMetric {
            metric_name_to_monitor,
            mode,
            keep_checkpoints_without_metrics,
        } => {
            let log: Arc<dyn MetricLog> = match metric_log {
                Some(log) => log,
                None if !is_object_store_path(&config.checkpoints_dir) => {
                    Arc::new(JsonlMetricLog::new(PathBuf::from(&config.checkpoints_dir)))
                }
                None => {
                    return Err(Error::invalid_config(
                        "best-metric retention on an object store needs a metric log",
                    ))
                }
            };
            Arc::new(KeepBest::new(
                keep,
                metric_name_to_monitor.clone(),
                *mode,
                *keep_checkpoints_without_metrics,
                log,
            ))
        }
    };
    Ok(Some(policy))
}

/// Saves and restores sharded training state
pub struct Checkpointer {
    config: CheckpointerConfig,
    router: Arc<StorageRouter>,
    root: ScopedStorage,
    coordinator: Arc<dyn HostCoordinator>,
    partitioner: Arc<dyn Partitioner>,
    dataset: Option<Arc<dyn DatasetIterator>>,
    retention: Option<Arc<dyn RetentionPolicy>>,
    template: StateDict<Value>,
    parameter_infos: ParameterInfos,
}

impl Checkpointer {
    pub fn builder(config: CheckpointerConfig) -> CheckpointerBuilder {
        CheckpointerBuilder::new(config)
    }

    pub fn config(&self) -> &CheckpointerConfig {
        &self.config
    }

    pub fn parameter_infos(&self) -> &ParameterInfos {
        &self.parameter_infos
    }

    /// Rebuild parameter infos after the state's structure changed
    pub fn set_template(&mut self, template: StateDict<Value>) -> Result<()> {
        self.parameter_infos =
            ParameterInfoBuilder::new(&self.config, self.partitioner.clone()).build(&template)?;
        self.template = template;
        debug!(leaves = self.parameter_infos.len(), "Rebuilt parameter infos");
        Ok(())
    }

    /// Published steps, ascending
    pub async fn all_steps(&self) -> Result<Vec<Step>> {
        layout::all_steps(&self.root).await
    }

    pub async fn latest_step(&self) -> Result<Option<Step>> {
        layout::latest_step(&self.root).await
    }

    /// Save `state` as `checkpoint_<state.step>`
    ///
    /// Must be called on every host. `concurrent_bytes` overrides the
    /// configured byte budget for this call.
    pub async fn save(
        &self,
        state: &TrainState,
        transforms: &[SaveTransform],
        concurrent_bytes: Option<u64>,
    ) -> Result<SaveOutcome> {
        self.writer()
            .save(
                state.step,
                state.state.clone(),
                self.parameter_infos.clone(),
                transforms,
                concurrent_bytes,
            )
            .await
    }

    /// Restore a checkpoint into the template's layout
    pub async fn restore(
        &self,
        options: RestoreOptions,
        transforms: &[RestoreTransform],
    ) -> Result<TrainState> {
        CheckpointReader {
            config: &self.config,
            router: &self.router,
            root: &self.root,
            partitioner: self.partitioner.as_ref(),
            dataset: self.dataset.as_deref(),
        }
        .restore(&self.template, &self.parameter_infos, options, transforms)
        .await
    }

    /// Restore from a safetensors file written by another framework
    pub async fn restore_from_foreign_format(
        &self,
        path: &str,
        strict: bool,
        translator: Option<&dyn CheckpointTranslator>,
    ) -> Result<TrainState> {
        let mut tensors = read_foreign_checkpoint(&self.router, path).await?;
        if let Some(translator) = translator {
            tensors = translator.translate(tensors)?;
        }
        info!(%path, tensors = tensors.len(), strict, "Restoring foreign checkpoint");
        restore_foreign(
            tensors,
            &self.template,
            &self.parameter_infos,
            strict,
            self.config.restore_dtype,
        )
    }

    /// Save a safetensors file as a native checkpoint
    ///
    /// The checkpoint's step is the file's `step` tensor, or 0. Its layout is
    /// derived from the file's tensors, not from the template.
    pub async fn convert_from_foreign_format(
        &self,
        path: &str,
        transforms: &[SaveTransform],
    ) -> Result<SaveOutcome> {
        let tensors = read_foreign_checkpoint(&self.router, path).await?;
        let step = foreign_step(&tensors);
        let infos =
            ParameterInfoBuilder::new(&self.config, self.partitioner.clone()).build(&tensors)?;
        info!(%path, step, tensors = tensors.len(), "Converting foreign checkpoint");
        self.writer()
            .save(step, tensors, infos, transforms, None)
            .await
    }

    fn writer(&self) -> CheckpointWriter<'_> {
        CheckpointWriter {
            config: &self.config,
            router: &self.router,
            root: &self.root,
            coordinator: self.coordinator.as_ref(),
            partitioner: self.partitioner.as_ref(),
            dataset: self.dataset.as_deref(),
            retention: self.retention.as_deref(),
        }
    }
}
