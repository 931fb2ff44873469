//! Shard manager behaviour against a scripted pod transport.

mod common;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use shardpod::cluster_storage::ClusterStorage;
use shardpod::events::ShardingEvent;
use shardpod::message::{BinaryMessage, ByteStream};
use shardpod::metrics::ClusterMetrics;
use shardpod::pod::Pod;
use shardpod::pods::Pods;
use shardpod::pods_health::PodsHealth;
use shardpod::prelude::*;
use shardpod::shard_manager::ShardManager;
use shardpod::storage::memory::MemoryStorage;
use shardpod::testing::test_manager_config;

/// Pods that accept every shard move unless marked dead or stalled.
#[derive(Default)]
struct FakePods {
    dead: Mutex<HashSet<PodAddress>>,
    /// Answer pings but never acknowledge a shard move.
    stalled: Mutex<HashSet<PodAddress>>,
    stalled_calls: AtomicUsize,
    moves: Mutex<Vec<(PodAddress, bool, BTreeSet<ShardId>)>>,
}

impl FakePods {
    fn kill(&self, pod: &PodAddress) {
        self.dead.lock().insert(pod.clone());
    }

    fn stall(&self, pod: &PodAddress) {
        self.stalled.lock().insert(pod.clone());
    }

    async fn hang_if_stalled(&self, pod: &PodAddress) {
        let stalled = self.stalled.lock().contains(pod);
        if stalled {
            self.stalled_calls.fetch_add(1, Ordering::SeqCst);
            futures::future::pending::<()>().await;
        }
    }

    fn check(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        if self.dead.lock().contains(pod) {
            return Err(ShardingError::PodUnavailable {
                address: pod.clone(),
                source: None,
            });
        }
        Ok(())
    }

    fn assigned_to(&self, pod: &PodAddress) -> usize {
        self.moves
            .lock()
            .iter()
            .filter(|(to, assigned, _)| to == pod && *assigned)
            .map(|(_, _, shards)| shards.len())
            .sum()
    }
}

#[async_trait]
impl Pods for FakePods {
    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        self.check(pod)
    }

    async fn assign_shards(
        &self,
        pod: &PodAddress,
        shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError> {
        self.check(pod)?;
        self.hang_if_stalled(pod).await;
        self.moves.lock().push((pod.clone(), true, shards.clone()));
        Ok(())
    }

    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError> {
        self.check(pod)?;
        self.hang_if_stalled(pod).await;
        self.moves.lock().push((pod.clone(), false, shards.clone()));
        Ok(())
    }

    async fn send_message(
        &self,
        pod: &PodAddress,
        _message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        self.check(pod)?;
        Ok(None)
    }

    async fn send_stream(
        &self,
        pod: &PodAddress,
        _message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError> {
        self.check(pod)?;
        Ok(Box::pin(futures::stream::empty()))
    }
}

#[async_trait]
impl PodsHealth for FakePods {
    async fn is_alive(&self, pod: &PodAddress) -> Result<bool, ShardingError> {
        Ok(self.check(pod).is_ok())
    }
}

fn addr(port: u16) -> PodAddress {
    PodAddress::new("10.0.0.1", port)
}

async fn start(
    storage: Arc<MemoryStorage>,
    pods: Arc<FakePods>,
    config: ManagerConfig,
) -> Arc<ShardManager> {
    ShardManager::start(
        config,
        storage,
        Arc::clone(&pods) as Arc<dyn Pods>,
        pods as Arc<dyn PodsHealth>,
        Arc::new(ClusterMetrics::unregistered()),
    )
    .await
    .expect("shard manager should start")
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let done = tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(done.is_ok(), "timed out waiting for {what}");
}

fn shard_counts(manager: &ShardManager) -> BTreeMap<PodAddress, usize> {
    manager
        .state()
        .shards_per_pod()
        .iter()
        .map(|(pod, shards)| (pod.clone(), shards.len()))
        .collect()
}

fn pods_owning_shards(manager: &ShardManager) -> usize {
    shard_counts(manager).values().filter(|count| **count > 0).count()
}

/// Next event that is not a periodic health probe.
async fn next_change(events: &mut (impl futures::Stream<Item = ShardingEvent> + Unpin)) -> ShardingEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream ended");
        if !matches!(event, ShardingEvent::PodHealthChecked { .. }) {
            return event;
        }
    }
}

#[tokio::test]
async fn first_pod_receives_every_shard() {
    common::init_tracing();
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    let mut events = manager.get_sharding_events();

    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();

    let registered = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap();
    assert_eq!(registered, Some(ShardingEvent::PodRegistered { pod: addr(1) }));
    let assigned = tokio::time::timeout(Duration::from_secs(5), events.next()).await.unwrap();
    assert_eq!(
        assigned,
        Some(ShardingEvent::ShardsAssigned {
            pod: addr(1),
            shards: ShardId::all(10).collect(),
        })
    );
    assert!(manager.state().unassigned_shards().is_empty());
    assert_eq!(pods.assigned_to(&addr(1)), 10);
}

#[tokio::test]
async fn unregistered_pods_hand_their_shards_over() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    manager.register(Pod::new(addr(2), "1.0.0")).await.unwrap();
    eventually("both pods own shards", || pods_owning_shards(&manager) == 2).await;

    manager.unregister(&addr(1)).await.unwrap();
    assert!(!manager.state().pods().contains_key(&addr(1)));
    eventually("all shards on the remaining pod", || {
        shard_counts(&manager).get(&addr(2)) == Some(&10)
    })
    .await;
}

#[tokio::test]
async fn balance_converges_after_a_pod_joins() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    eventually("first pod owns everything", || {
        shard_counts(&manager).get(&addr(1)) == Some(&10)
    })
    .await;

    manager.register(Pod::new(addr(2), "1.0.0")).await.unwrap();
    eventually("shards split evenly", || {
        let counts = shard_counts(&manager);
        counts.get(&addr(1)) == Some(&5) && counts.get(&addr(2)) == Some(&5)
    })
    .await;
    assert!(manager.state().unassigned_shards().is_empty());
}

#[tokio::test]
async fn mixed_versions_hold_back_balancing() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    eventually("old pod owns everything", || {
        shard_counts(&manager).get(&addr(1)) == Some(&10)
    })
    .await;

    manager.register(Pod::new(addr(2), "1.1.0")).await.unwrap();
    // Several balance intervals pass without any move.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(shard_counts(&manager).get(&addr(2)), Some(&0));

    // Once the old pod leaves, the upgraded one takes over.
    manager.unregister(&addr(1)).await.unwrap();
    eventually("upgraded pod owns everything", || {
        shard_counts(&manager).get(&addr(2)) == Some(&10)
    })
    .await;
}

#[tokio::test]
async fn start_up_drops_dead_stored_pods() {
    let assignments = ShardId::all(10)
        .map(|shard| {
            let owner = if shard.0 <= 5 { addr(1) } else { addr(2) };
            (shard, Some(owner))
        })
        .collect();
    let storage = Arc::new(MemoryStorage::with_state(
        vec![Pod::new(addr(1), "1.0.0"), Pod::new(addr(2), "1.0.0")],
        assignments,
    ));
    let pods = Arc::new(FakePods::default());
    pods.kill(&addr(2));

    let manager = start(storage, Arc::clone(&pods), test_manager_config(10)).await;
    let state = manager.state();
    assert_eq!(state.pods().len(), 1);
    assert!(state.pods().contains_key(&addr(1)));
    assert_eq!(state.owner(ShardId(1)), Some(&addr(1)));
    assert_eq!(state.owner(ShardId(6)), None);

    eventually("orphaned shards reassigned", || {
        shard_counts(&manager).get(&addr(1)) == Some(&10)
    })
    .await;
}

#[tokio::test]
async fn persistence_is_retried_until_storage_recovers() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_failing(true);
    let pods = Arc::new(FakePods::default());
    let config = ManagerConfig {
        persist_retry_count: 1000,
        ..test_manager_config(10)
    };
    let manager = start(Arc::clone(&storage), Arc::clone(&pods), config).await;

    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    eventually("shards assigned in memory", || {
        manager.state().unassigned_shards().is_empty()
    })
    .await;
    assert_eq!(storage.save_count(), 0);
    assert!(storage.get_pods().await.unwrap().is_empty());

    storage.set_failing(false);
    eventually("state persisted", || storage.save_count() >= 2).await;
    assert_eq!(storage.get_pods().await.unwrap(), vec![Pod::new(addr(1), "1.0.0")]);
    let stored = storage.get_assignments().await.unwrap();
    assert_eq!(stored.len(), 10);
    assert!(stored.values().all(|owner| owner.as_ref() == Some(&addr(1))));
}

#[tokio::test]
async fn dead_pods_are_unregistered_by_health_checks() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    manager.register(Pod::new(addr(2), "1.0.0")).await.unwrap();
    eventually("both pods own shards", || pods_owning_shards(&manager) == 2).await;

    pods.kill(&addr(2));
    manager.check_all_pods_health().await;
    assert!(!manager.state().pods().contains_key(&addr(2)));
    eventually("survivor owns everything", || {
        shard_counts(&manager).get(&addr(1)) == Some(&10)
    })
    .await;
}

#[tokio::test]
async fn live_pods_survive_unhealthy_reports() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();

    manager.notify_unhealthy_pod(&addr(1)).await;
    assert!(manager.state().pods().contains_key(&addr(1)));
}

#[tokio::test]
async fn unregistering_a_pod_reports_its_shards_before_the_pod() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    eventually("pod owns everything", || {
        shard_counts(&manager).get(&addr(1)) == Some(&10)
    })
    .await;

    let mut events = manager.get_sharding_events();
    manager.unregister(&addr(1)).await.unwrap();
    assert_eq!(
        next_change(&mut events).await,
        ShardingEvent::ShardsUnassigned {
            pod: addr(1),
            shards: ShardId::all(10).collect(),
        }
    );
    assert_eq!(
        next_change(&mut events).await,
        ShardingEvent::PodUnregistered { pod: addr(1) }
    );
}

#[tokio::test]
async fn stalled_pod_does_not_block_rebalancing() {
    let pods = Arc::new(FakePods::default());
    let config = ManagerConfig {
        pod_operation_timeout: Duration::from_millis(100),
        ..test_manager_config(10)
    };
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), config).await;
    pods.stall(&addr(1));
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    eventually("assignment to the stalled pod attempted", || {
        pods.stalled_calls.load(Ordering::SeqCst) > 0
    })
    .await;

    manager.register(Pod::new(addr(2), "1.0.0")).await.unwrap();
    eventually("healthy pod receives shards", || {
        shard_counts(&manager).get(&addr(2)).copied().unwrap_or(0) > 0
    })
    .await;
    assert_eq!(shard_counts(&manager).get(&addr(1)), Some(&0));
    assert!(manager.state().pods().contains_key(&addr(1)));
}

#[tokio::test]
async fn stopped_manager_rejects_membership_changes() {
    let pods = Arc::new(FakePods::default());
    let manager = start(Arc::new(MemoryStorage::new()), Arc::clone(&pods), test_manager_config(10)).await;
    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();

    manager.shutdown();
    let err = manager.register(Pod::new(addr(2), "1.0.0")).await.unwrap_err();
    assert!(matches!(err, ShardingError::ShuttingDown));
    let err = manager.unregister(&addr(1)).await.unwrap_err();
    assert!(matches!(err, ShardingError::ShuttingDown));
    assert!(manager.state().pods().contains_key(&addr(1)));
    assert!(!manager.state().pods().contains_key(&addr(2)));
}

#[tokio::test]
async fn exhausted_persistence_retries_keep_state_in_memory() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_failing(true);
    let pods = Arc::new(FakePods::default());
    let config = ManagerConfig {
        persist_retry_count: 2,
        persist_retry_interval: Duration::from_millis(10),
        ..test_manager_config(10)
    };
    let manager = start(Arc::clone(&storage), Arc::clone(&pods), config).await;

    manager.register(Pod::new(addr(1), "1.0.0")).await.unwrap();
    eventually("shards assigned in memory", || {
        shard_counts(&manager).get(&addr(1)) == Some(&10)
    })
    .await;
    // Retries are spent well within this window.
    tokio::time::sleep(Duration::from_millis(300)).await;

    storage.set_failing(false);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(storage.save_count(), 0);
    assert!(storage.get_pods().await.unwrap().is_empty());
    assert!(storage.get_assignments().await.unwrap().is_empty());
    assert!(manager.state().unassigned_shards().is_empty());

    manager.register(Pod::new(addr(2), "1.0.0")).await.unwrap();
    let stored = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let stored = storage.get_pods().await.unwrap();
            if stored.len() == 2 {
                return stored;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("membership persisted again");
    assert_eq!(
        stored,
        vec![Pod::new(addr(1), "1.0.0"), Pod::new(addr(2), "1.0.0")]
    );
}
