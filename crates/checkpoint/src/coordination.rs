//! Host coordination collaborator
//!
//! Saves need two cross-host primitives: a value broadcast from the primary
//! host and named barriers. [`SingleHost`] serves one process;
//! [`LocalCluster`] runs several hosts inside one process, which is how the
//! multi-host save protocol is exercised in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use runtime_core::{Error, ProcessIndex, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// Cross-host primitives used by the save protocol
#[async_trait]
pub trait HostCoordinator: Send + Sync {
    fn process_index(&self) -> ProcessIndex;

    fn process_count(&self) -> usize;

    /// Whether this host performs the single-writer steps of a save
    fn is_primary(&self) -> bool {
        self.process_index() == 0
    }

    /// Every host receives the primary's `value`
    async fn broadcast_from_primary(&self, name: &str, value: i64) -> Result<i64>;

    /// Wait until every host has reached the barrier `name`
    async fn barrier(&self, name: &str) -> Result<()>;
}

/// Coordinator for a single process
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleHost;

#[async_trait]
impl HostCoordinator for SingleHost {
    fn process_index(&self) -> ProcessIndex {
        0
    }

    fn process_count(&self) -> usize {
        1
    }

    async fn broadcast_from_primary(&self, _name: &str, value: i64) -> Result<i64> {
        Ok(value)
    }

    async fn barrier(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct BarrierState {
    arrived: usize,
    waiters: Vec<oneshot::Sender<()>>,
}

struct BroadcastSlot {
    sender: watch::Sender<Option<i64>>,
    observed: AtomicUsize,
}

struct ClusterState {
    size: usize,
    barriers: Mutex<HashMap<String, BarrierState>>,
    broadcasts: DashMap<String, Arc<BroadcastSlot>>,
}

/// In-process group of hosts sharing barriers and broadcasts
#[derive(Clone)]
pub struct LocalCluster {
    state: Arc<ClusterState>,
}

impl LocalCluster {
    pub fn new(size: usize) -> Self {
        Self {
            state: Arc::new(ClusterState {
                size,
                barriers: Mutex::new(HashMap::new()),
                broadcasts: DashMap::new(),
            }),
        }
    }

    /// Coordinator handle for host `index`
    pub fn member(&self, index: ProcessIndex) -> ClusterMember {
        ClusterMember {
            index,
            state: self.state.clone(),
            broadcasts_seen: AtomicU64::new(0),
        }
    }

    /// Broadcasts not yet observed by every host
    pub fn pending_broadcasts(&self) -> usize {
        self.state.broadcasts.len()
    }
}

/// One host of a [`LocalCluster`]
pub struct ClusterMember {
    index: ProcessIndex,
    state: Arc<ClusterState>,
    broadcasts_seen: AtomicU64,
}

#[async_trait]
impl HostCoordinator for ClusterMember {
    fn process_index(&self) -> ProcessIndex {
        self.index
    }

    fn process_count(&self) -> usize {
        self.state.size
    }

    async fn broadcast_from_primary(&self, name: &str, value: i64) -> Result<i64> {
        // Hosts issue broadcasts in the same order, so the sequence number
        // tells repeated broadcasts under one name apart.
        let sequence = self.broadcasts_seen.fetch_add(1, Ordering::SeqCst);
        let key = format!("{}#{}", name, sequence);
        let slot = self
            .state
            .broadcasts
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(BroadcastSlot {
                    sender: watch::channel(None).0,
                    observed: AtomicUsize::new(0),
                })
            })
            .clone();

        let received = if self.is_primary() {
            slot.sender.send_replace(Some(value));
            value
        } else {
            let mut receiver = slot.sender.subscribe();
            let received = *receiver
                .wait_for(Option::is_some)
                .await
                .map_err(|_| Error::ChannelClosed {
                    channel: format!("broadcast {}", name),
                })?;
            received.ok_or_else(|| Error::Internal {
                message: format!("broadcast {} completed without a value", name),
            })?
        };

        // The last host to observe the value drops the slot.
        if slot.observed.fetch_add(1, Ordering::SeqCst) + 1 >= self.state.size {
            self.state.broadcasts.remove(&key);
        }
        Ok(received)
    }

    async fn barrier(&self, name: &str) -> Result<()> {
        let receiver = {
            let mut barriers = self.state.barriers.lock();
            let barrier = barriers.entry(name.to_string()).or_default();
            barrier.arrived += 1;

            if barrier.arrived >= self.state.size {
                if let Some(done) = barriers.remove(name) {
                    for waiter in done.waiters {
                        let _ = waiter.send(());
                    }
                }
                debug!(barrier = name, host = self.index, "Barrier released");
                return Ok(());
            }

            let (tx, rx) = oneshot::channel();
            barrier.waiters.push(tx);
            rx
        };

        receiver.await.map_err(|_| Error::ChannelClosed {
            channel: format!("barrier {}", name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_single_host() {
        let host = SingleHost;
        assert!(host.is_primary());
        assert_eq!(host.broadcast_from_primary("ts", 7).await.unwrap(), 7);
        host.barrier("b").await.unwrap();
    }

    #[tokio::test]
    async fn test_barrier_releases_all_hosts() {
        let cluster = LocalCluster::new(3);
        let handles: Vec<_> = (0..3)
            .map(|i| {
                let member = cluster.member(i);
                tokio::spawn(async move { member.barrier("checkpointer:make_dir:x").await })
            })
            .collect();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_barrier_waits_for_stragglers() {
        let cluster = LocalCluster::new(2);
        let first = cluster.member(0);
        let waiting = tokio::spawn(async move { first.barrier("b").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        cluster.member(1).barrier("b").await.unwrap();
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_reaches_followers() {
        let cluster = LocalCluster::new(2);
        let follower = cluster.member(1);
        let pending = tokio::spawn(async move { follower.broadcast_from_primary("ts", -1).await });

        let primary = cluster.member(0);
        assert_eq!(primary.broadcast_from_primary("ts", 42).await.unwrap(), 42);
        assert_eq!(pending.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_repeated_broadcast_names() {
        let cluster = LocalCluster::new(2);
        let primary = cluster.member(0);
        let follower = cluster.member(1);

        for value in [1, 2] {
            primary.broadcast_from_primary("ts", value).await.unwrap();
            assert_eq!(cluster.pending_broadcasts(), 1);
            assert_eq!(follower.broadcast_from_primary("ts", 0).await.unwrap(), value);
            assert_eq!(cluster.pending_broadcasts(), 0);
        }
    }
}
