//! In-process clusters for unit and integration testing.
//!
//! [`TestCluster`] runs a shard manager and any number of pods in one
//! process: storage is a [`MemoryStorage`], pods talk through
//! [`LocalPods`], which also answers the shard manager's health probes.
//! Intervals are short so rebalancing settles within milliseconds.
//!
//! # Example
//!
//! ```ignore
//! let cluster = TestCluster::new(3).await;
//! cluster.pod(0).register_entity(&COUNTER, counter_behaviour)?;
//! let count: u64 = cluster.pod(0).messenger(&COUNTER).send("c-1", CounterMsg::Get).await?;
//! cluster.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ManagerConfig, ShardingConfig};
use crate::metrics::ClusterMetrics;
use crate::shard_manager::ShardManager;
use crate::shard_manager_client::LocalShardManagerClient;
use crate::sharding::Sharding;
use crate::storage::local_pods::LocalPods;
use crate::storage::memory::MemoryStorage;
use crate::storage::noop_pods::NoopPods;
use crate::types::PodAddress;

const BASE_PORT: u16 = 54321;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shard manager configuration tuned for tests.
pub fn test_manager_config(number_of_shards: u32) -> ManagerConfig {
    ManagerConfig {
        number_of_shards,
        rebalance_interval: Duration::from_millis(50),
        rebalance_retry_interval: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(200),
        pod_operation_timeout: Duration::from_secs(2),
        persist_retry_interval: Duration::from_millis(10),
        persist_retry_count: 10,
        rebalance_rate: 1.0,
        pod_health_check_interval: Duration::from_millis(200),
        health_check_concurrency: 4,
    }
}

/// Pod configuration tuned for tests.
pub fn test_pod_config(number_of_shards: u32) -> ShardingConfig {
    ShardingConfig {
        number_of_shards,
        entity_termination_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_secs(5),
        refresh_assignments_retry_interval: Duration::from_millis(50),
        unresolved_retry_interval: Duration::from_millis(10),
        send_retry_interval: Duration::from_millis(20),
        entity_restart_backoff: Duration::from_millis(10),
        stream_restart_delay: Duration::from_millis(20),
        ..ShardingConfig::default()
    }
}

/// A shard manager plus pods, all in one process.
pub struct TestCluster {
    manager: Arc<ShardManager>,
    storage: Arc<MemoryStorage>,
    transport: Arc<LocalPods>,
    members: Vec<Arc<Sharding>>,
    pod_config: ShardingConfig,
}

impl TestCluster {
    /// Starts a cluster of `pod_count` registered pods over 30 shards and
    /// waits until every shard is assigned.
    pub async fn new(pod_count: usize) -> Self {
        Self::with_config(pod_count, test_manager_config(30), test_pod_config(30)).await
    }

    pub async fn with_config(
        pod_count: usize,
        manager_config: ManagerConfig,
        pod_config: ShardingConfig,
    ) -> Self {
        let storage = Arc::new(MemoryStorage::new());
        let transport = Arc::new(LocalPods::new());
        let manager = ShardManager::start(
            manager_config,
            Arc::clone(&storage) as _,
            Arc::clone(&transport) as _,
            Arc::clone(&transport) as _,
            Arc::new(ClusterMetrics::unregistered()),
        )
        .await
        .expect("test shard manager config should be valid");

        let mut cluster = Self {
            manager,
            storage,
            transport,
            members: Vec::new(),
            pod_config,
        };
        for _ in 0..pod_count {
            cluster.add_pod().await;
        }
        if pod_count > 0 {
            cluster.wait_until_assigned().await;
        }
        cluster
    }

    /// Creates a pod reachable through the cluster's transport without
    /// registering it with the shard manager.
    pub fn start_pod(&mut self) -> Arc<Sharding> {
        let port = BASE_PORT + self.members.len() as u16;
        let config = ShardingConfig {
            address: PodAddress::new("localhost", port),
            ..self.pod_config.clone()
        };
        let sharding = Sharding::new(
            config,
            Arc::clone(&self.transport) as _,
            Arc::clone(&self.manager) as _,
            Arc::clone(&self.storage) as _,
            Arc::new(ClusterMetrics::unregistered()),
        )
        .expect("test pod config should be valid");
        self.transport.register(&sharding);
        self.members.push(Arc::clone(&sharding));
        sharding
    }

    /// Creates a pod and registers it with the shard manager.
    pub async fn add_pod(&mut self) -> Arc<Sharding> {
        let sharding = self.start_pod();
        sharding
            .register()
            .await
            .expect("registering a test pod should succeed");
        sharding
    }

    pub fn pod(&self, index: usize) -> &Arc<Sharding> {
        &self.members[index]
    }

    pub fn pods(&self) -> &[Arc<Sharding>] {
        &self.members
    }

    pub fn manager(&self) -> &Arc<ShardManager> {
        &self.manager
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn transport(&self) -> &Arc<LocalPods> {
        &self.transport
    }

    /// Waits until every shard has an owner and every registered pod's
    /// cache agrees with the shard manager.
    pub async fn wait_until_assigned(&self) {
        self.wait_for("all shards assigned", |cluster| cluster.is_settled())
            .await;
    }

    /// Waits until shard counts of registered pods differ by at most one
    /// and every cache agrees with the shard manager.
    pub async fn wait_until_balanced(&self) {
        self.wait_for("shards balanced", |cluster| {
            let state = cluster.manager.state();
            let counts: Vec<usize> = state.shards_per_pod().values().map(|s| s.len()).collect();
            let balanced = match (counts.iter().min(), counts.iter().max()) {
                (Some(min), Some(max)) => max - min <= 1,
                _ => false,
            };
            balanced && cluster.is_settled()
        })
        .await;
    }

    /// Polls `condition` until it holds. Panics after a generous timeout.
    pub async fn wait_for(&self, what: &str, condition: impl Fn(&Self) -> bool) {
        let settled = tokio::time::timeout(SETTLE_TIMEOUT, async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "timed out waiting for {what}");
    }

    fn is_settled(&self) -> bool {
        let state = self.manager.state();
        if !state.unassigned_shards().is_empty() {
            return false;
        }
        self.members
            .iter()
            .filter(|pod| state.pods().contains_key(pod.address()))
            .all(|pod| {
                state
                    .shards()
                    .iter()
                    .all(|(shard, owner)| pod.shard_owner(*shard).as_ref() == owner.as_ref())
            })
    }

    /// Unregisters every registered pod and stops the shard manager.
    pub async fn shutdown(self) {
        for pod in &self.members {
            if self.manager.state().pods().contains_key(pod.address()) {
                if let Err(err) = pod.unregister().await {
                    tracing::warn!(pod = %pod.address(), error = %err, "test pod failed to unregister");
                }
            }
        }
        self.manager.shutdown();
    }
}

/// A single pod owning every shard, with no shard manager and no peers.
pub async fn single_pod(config: ShardingConfig) -> Arc<Sharding> {
    let client = LocalShardManagerClient::new(config.address.clone(), config.number_of_shards);
    let number_of_shards = config.number_of_shards as usize;
    let sharding = Sharding::new(
        config,
        Arc::new(NoopPods),
        Arc::new(client),
        Arc::new(MemoryStorage::new()),
        Arc::new(ClusterMetrics::unregistered()),
    )
    .expect("single pod config should be valid");
    sharding
        .register()
        .await
        .expect("registering with the local client cannot fail");

    let bootstrapped = tokio::time::timeout(SETTLE_TIMEOUT, async {
        while sharding.known_shards() < number_of_shards {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(bootstrapped.is_ok(), "single pod never learned its shards");
    sharding
}
