use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use checkpoint::{AxisRule, Checkpointer, LocalCluster, MeshPartitioner, RestoreOptions, SaveOutcome};
use runtime_core::{CheckpointerConfig, Error, NdArray, StateDict, TrainState, Value};
use std::sync::{Arc, Mutex};
use storage::{MemoryConnector, MemoryStorage, ObjectStoreConnector, StorageBackend, StorageRouter};

fn state() -> StateDict<Value> {
    let kernel: Vec<f32> = (0..32).map(|v| v as f32).collect();
    let mut state = StateDict::new();
    state.insert(
        "target/dense/kernel",
        Value::Array(NdArray::from_vec(vec![4, 8], kernel).unwrap()),
    );
    state.insert(
        "target/dense/bias",
        Value::Array(NdArray::from_vec(vec![8], vec![0.5f32; 8]).unwrap()),
    );
    state
}

/// Bucket that records every write and can fail writes under a prefix
///
/// With a prefix armed, `allowed` writes under it go through before the
/// rest fail.
struct FaultyBucket {
    inner: MemoryStorage,
    writes: Mutex<Vec<String>>,
    fault: Mutex<Option<(String, usize)>>,
}

impl FaultyBucket {
    fn new(inner: MemoryStorage) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes: Mutex::new(Vec::new()),
            fault: Mutex::new(None),
        })
    }

    fn fail_under(&self, prefix: &str, allowed: usize) {
        *self.fault.lock().unwrap() = Some((prefix.to_string(), allowed));
    }

    fn heal(&self) {
        *self.fault.lock().unwrap() = None;
    }

    fn written(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    fn record_write(&self, path: &str) -> runtime_core::Result<()> {
        if let Some((prefix, allowed)) = self.fault.lock().unwrap().as_mut() {
            if path.starts_with(prefix.as_str()) {
                if *allowed == 0 {
                    return Err(Error::Storage {
                        message: format!("connection reset writing `{}`", path),
                    });
                }
                *allowed -= 1;
            }
        }
        self.writes.lock().unwrap().push(path.to_string());
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FaultyBucket {
    async fn read(&self, path: &str) -> runtime_core::Result<Bytes> {
        self.inner.read(path).await
    }

    async fn write(&self, path: &str, data: Bytes) -> runtime_core::Result<u64> {
        self.record_write(path)?;
        self.inner.write(path, data).await
    }

    async fn delete(&self, path: &str) -> runtime_core::Result<()> {
        self.inner.delete(path).await
    }

    async fn exists(&self, path: &str) -> runtime_core::Result<bool> {
        self.inner.exists(path).await
    }

    async fn list(&self, prefix: &str) -> runtime_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

struct BucketConnector {
    bucket: Arc<FaultyBucket>,
}

#[async_trait]
impl ObjectStoreConnector for BucketConnector {
    async fn connect(
        &self,
        _scheme: &str,
        _bucket: &str,
    ) -> runtime_core::Result<Arc<dyn StorageBackend>> {
        let backend: Arc<dyn StorageBackend> = self.bucket.clone();
        Ok(backend)
    }
}

fn router_for(bucket: &Arc<FaultyBucket>) -> Arc<StorageRouter> {
    let connector: Arc<dyn ObjectStoreConnector> = Arc::new(BucketConnector {
        bucket: bucket.clone(),
    });
    Arc::new(StorageRouter::with_connector(connector))
}

#[tokio::test]
async fn test_interrupted_promotion_is_not_published() -> Result<()> {
    let store = MemoryConnector::new().bucket("b");
    let bucket = FaultyBucket::new(store.clone());
    let checkpointer = Checkpointer::builder(CheckpointerConfig::new("mem://b/run"))
        .router(router_for(&bucket))
        .build(state())
        .await?;

    // the copy into the final directory dies after one object
    bucket.fail_under("run/checkpoint_1/", 1);
    let failed = checkpointer.save(&TrainState::new(1, state()), &[], None).await;
    assert!(matches!(failed, Err(Error::Storage { .. })));
    assert!(!store.list("run/checkpoint_1/").await?.is_empty());
    assert!(!store.exists("run/checkpoint_1/checkpoint").await?);

    assert!(checkpointer.all_steps().await?.is_empty());
    assert_eq!(checkpointer.latest_step().await?, None);

    bucket.heal();
    let outcome = checkpointer.save(&TrainState::new(1, state()), &[], None).await?;
    assert_eq!(outcome, SaveOutcome::Published { step: 1, deleted: vec![] });
    assert_eq!(checkpointer.all_steps().await?, vec![1]);

    let restored = checkpointer.restore(RestoreOptions::default(), &[]).await?;
    assert_eq!(restored.step, 1);
    let bias = restored
        .state
        .get("target/dense/bias")
        .and_then(Value::as_array)
        .unwrap()
        .to_vec::<f32>()?;
    assert_eq!(bias, vec![0.5; 8]);
    Ok(())
}

#[tokio::test]
async fn test_replicas_skip_replicated_leaves() -> Result<()> {
    let store = MemoryConnector::new().bucket("b");
    let cluster = LocalCluster::new(2);
    let buckets = [FaultyBucket::new(store.clone()), FaultyBucket::new(store.clone())];

    let mut hosts = Vec::new();
    for (process, bucket) in buckets.iter().enumerate() {
        let partitioner = MeshPartitioner::new(vec![("model".to_string(), 2)], process)?
            .with_rule(
                ".*/kernel",
                AxisRule::Sharded(vec![None, Some("model".to_string())]),
            )?;
        hosts.push(
            Checkpointer::builder(CheckpointerConfig::new("mem://b/run"))
                .router(router_for(bucket))
                .coordinator(Arc::new(cluster.member(process)))
                .partitioner(Arc::new(partitioner))
                .build(state())
                .await?,
        );
    }

    let train_state = TrainState::new(3, state());
    let (first, second) = tokio::try_join!(
        hosts[0].save(&train_state, &[], None),
        hosts[1].save(&train_state, &[], None)
    )?;
    assert_eq!(first, SaveOutcome::Published { step: 3, deleted: vec![] });
    assert_eq!(second, SaveOutcome::Written { step: 3 });

    // the bias is replicated over the model axis; only replica 0 stores it
    let primary = buckets[0].written();
    let replica = buckets[1].written();
    assert!(primary.iter().any(|key| key.contains("target.dense.bias")));
    assert!(!replica.iter().any(|key| key.contains("target.dense.bias")));

    // each host stores its own kernel columns
    assert!(replica.iter().any(|key| key.contains("target.dense.kernel")));
    assert!(!replica.iter().any(|key| key.ends_with("/checkpoint")));
    Ok(())
}
