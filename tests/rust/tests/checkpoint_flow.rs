use anyhow::Result;
use bytes::Bytes;
use checkpoint::{
    load_checkpoint, AxisRule, Checkpointer, DatasetIterator, LocalCluster, MeshPartitioner,
    RestoreOptions, SaveOutcome,
};
use runtime_core::{
    CheckpointerConfig, Error, MetricMode, NdArray, RetentionConfig, Scalar, StateDict, TrainState,
    Value,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use storage::{MemoryConnector, StorageRouter};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn kernel_values() -> Vec<f32> {
    (0..32).map(|v| v as f32).collect()
}

fn train_state() -> StateDict<Value> {
    let mut state = StateDict::new();
    state.insert(
        "target/dense/kernel",
        Value::Array(NdArray::from_vec(vec![4, 8], kernel_values()).unwrap()),
    );
    state.insert(
        "target/dense/bias",
        Value::Array(NdArray::from_vec(vec![8], vec![0.5f32; 8]).unwrap()),
    );
    state.insert("state/step", Value::Scalar(Scalar::Int(0)));
    state
}

fn array(state: &StateDict<Value>, name: &str) -> Vec<f32> {
    state
        .get(name)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("`{}` is not a materialized array", name))
        .to_vec::<f32>()
        .unwrap()
}

fn dir_string(dir: &TempDir) -> String {
    dir.path().to_string_lossy().to_string()
}

/// Counts batches; the snapshot is the count as decimal text
#[derive(Default)]
struct CountingDataset {
    position: AtomicU64,
}

impl DatasetIterator for CountingDataset {
    fn save(&self) -> runtime_core::Result<Bytes> {
        Ok(Bytes::from(self.position.load(Ordering::SeqCst).to_string()))
    }

    fn restore(&self, snapshot: Bytes) -> runtime_core::Result<()> {
        let text = String::from_utf8_lossy(&snapshot).to_string();
        let position = text.parse().map_err(|_| Error::Internal {
            message: format!("bad dataset snapshot `{}`", text),
        })?;
        self.position.store(position, Ordering::SeqCst);
        Ok(())
    }
}

fn model_parallel(process: usize) -> MeshPartitioner {
    MeshPartitioner::new(vec![("model".to_string(), 2)], process)
        .unwrap()
        .with_rule(
            ".*/kernel",
            AxisRule::Sharded(vec![None, Some("model".to_string())]),
        )
        .unwrap()
}

#[tokio::test]
async fn test_two_host_save_and_restore() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let cluster = LocalCluster::new(2);

    let mut hosts = Vec::new();
    for process in 0..2 {
        hosts.push(
            Checkpointer::builder(CheckpointerConfig::new(dir_string(&dir)))
                .coordinator(Arc::new(cluster.member(process)))
                .partitioner(Arc::new(model_parallel(process)))
                .build(train_state())
                .await?,
        );
    }

    let state = TrainState::new(10, train_state());
    let (first, second) = tokio::try_join!(
        hosts[0].save(&state, &[], None),
        hosts[1].save(&state, &[], None)
    )?;
    assert_eq!(first, SaveOutcome::Published { step: 10, deleted: vec![] });
    assert_eq!(second, SaveOutcome::Written { step: 10 });

    // each host gets back the columns it owns
    let restored = hosts[1].restore(RestoreOptions::default(), &[]).await?;
    assert_eq!(restored.step, 10);
    let expected: Vec<f32> = kernel_values()
        .chunks(8)
        .flat_map(|row| row[4..].to_vec())
        .collect();
    assert_eq!(array(&restored.state, "target/dense/kernel"), expected);
    assert_eq!(array(&restored.state, "target/dense/bias"), vec![0.5; 8]);

    // a reader without a target structure sees the whole array
    let router = Arc::new(StorageRouter::local());
    let loaded = load_checkpoint(router, &dir_string(&dir), Some(10), &[], &[], None, false).await?;
    assert_eq!(array(&loaded.state, "target/dense/kernel"), kernel_values());
    Ok(())
}

#[tokio::test]
async fn test_save_is_idempotent_per_step() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let checkpointer = Checkpointer::builder(CheckpointerConfig::new(dir_string(&dir)))
        .build(train_state())
        .await?;

    let state = TrainState::new(3, train_state());
    checkpointer.save(&state, &[], None).await?;
    let again = checkpointer.save(&state, &[], None).await?;
    assert_eq!(again, SaveOutcome::Skipped { step: 3 });
    assert_eq!(checkpointer.all_steps().await?, vec![3]);
    Ok(())
}

#[tokio::test]
async fn test_recency_retention() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let mut config = CheckpointerConfig::new(dir_string(&dir));
    config.keep = Some(2);
    let checkpointer = Checkpointer::builder(config).build(train_state()).await?;

    let mut last = None;
    for step in 1..=4 {
        last = Some(
            checkpointer
                .save(&TrainState::new(step, train_state()), &[], None)
                .await?,
        );
    }
    assert_eq!(last, Some(SaveOutcome::Published { step: 4, deleted: vec![2] }));
    assert_eq!(checkpointer.all_steps().await?, vec![3, 4]);
    assert!(!dir.path().join("checkpoint_1").exists());
    Ok(())
}

#[tokio::test]
async fn test_best_metric_retention_from_jsonl_logs() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let eval_dir = dir.path().join("eval");
    std::fs::create_dir_all(&eval_dir)?;
    std::fs::write(
        eval_dir.join("metrics.jsonl"),
        concat!(
            "{\"step\":1,\"tag\":\"accuracy\",\"value\":0.2}\n",
            "{\"step\":2,\"tag\":\"accuracy\",\"value\":0.9}\n",
        ),
    )?;

    let mut config = CheckpointerConfig::new(dir_string(&dir));
    config.keep = Some(1);
    config.retention = RetentionConfig::BestMetric {
        metric_name_to_monitor: "eval/accuracy".to_string(),
        mode: MetricMode::Max,
        keep_checkpoints_without_metrics: false,
    };
    let checkpointer = Checkpointer::builder(config).build(train_state()).await?;

    for step in 1..=3 {
        checkpointer
            .save(&TrainState::new(step, train_state()), &[], None)
            .await?;
    }
    // step 3 has no metric yet but is the latest
    assert_eq!(checkpointer.all_steps().await?, vec![2, 3]);
    Ok(())
}

#[tokio::test]
async fn test_fallback_fills_new_parameters() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let config = CheckpointerConfig::new(dir_string(&dir));
    Checkpointer::builder(config.clone())
        .build(train_state())
        .await?
        .save(&TrainState::new(5, train_state()), &[], None)
        .await?;

    let mut grown = train_state();
    grown.insert(
        "target/head/kernel",
        Value::Array(NdArray::from_vec(vec![2], vec![7f32, 7.])?),
    );
    let checkpointer = Checkpointer::builder(config).build(grown.clone()).await?;

    let missing = checkpointer.restore(RestoreOptions::default(), &[]).await;
    assert!(matches!(missing, Err(Error::NotFound { .. })));

    let restored = checkpointer
        .restore(
            RestoreOptions {
                fallback_state: Some(grown),
                ..Default::default()
            },
            &[],
        )
        .await?;
    assert_eq!(array(&restored.state, "target/head/kernel"), vec![7., 7.]);
    assert_eq!(array(&restored.state, "target/dense/kernel"), kernel_values());
    Ok(())
}

#[tokio::test]
async fn test_dataset_position_round_trip() -> Result<()> {
    init_tracing();
    let dir = TempDir::new()?;
    let dataset = Arc::new(CountingDataset::default());
    dataset.position.store(42, Ordering::SeqCst);

    let checkpointer = Checkpointer::builder(CheckpointerConfig::new(dir_string(&dir)))
        .dataset(dataset.clone())
        .build(train_state())
        .await?;
    checkpointer
        .save(&TrainState::new(1, train_state()), &[], None)
        .await?;
    assert!(dir.path().join("checkpoint_1/train_ds-000-of-001").exists());

    dataset.position.store(0, Ordering::SeqCst);
    checkpointer.restore(RestoreOptions::default(), &[]).await?;
    assert_eq!(dataset.position.load(Ordering::SeqCst), 42);
    Ok(())
}

#[tokio::test]
async fn test_object_store_checkpoint_moves_to_local_disk() -> Result<()> {
    init_tracing();
    let connector = Arc::new(MemoryConnector::new());
    let router = Arc::new(StorageRouter::with_connector(connector.clone()));

    let checkpointer = Checkpointer::builder(CheckpointerConfig::new("mem://bucket/run"))
        .router(router.clone())
        .build(train_state())
        .await?;
    checkpointer
        .save(&TrainState::new(8, train_state()), &[], None)
        .await?;
    assert_eq!(checkpointer.all_steps().await?, vec![8]);
    assert!(!connector.bucket("bucket").is_empty());

    // copy the published directory object by object
    let dir = TempDir::new()?;
    let source = router.open_path("mem://bucket/run/checkpoint_8").await?;
    let target = StorageRouter::local()
        .open_path(&format!("{}/checkpoint_8", dir_string(&dir)))
        .await?;
    for key in source.list("").await? {
        target.write(&key, source.read(&key).await?).await?;
    }

    let loaded = load_checkpoint(
        Arc::new(StorageRouter::local()),
        &format!("{}/checkpoint_8", dir_string(&dir)),
        None,
        &[],
        &[],
        None,
        false,
    )
    .await?;
    assert_eq!(loaded.step, 8);
    assert_eq!(array(&loaded.state, "target/dense/kernel"), kernel_values());
    Ok(())
}
