//! Cluster-wide shard manager.
//!
//! Owns the [`ShardManagerState`], registers and unregisters pods, probes
//! their health and moves shards between them. Rebalancing is serialized by
//! a single-permit semaphore; registration and health checks run
//! concurrently and only queue a rebalance.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, Semaphore};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::cluster_storage::{Assignments, ClusterStorage};
use crate::config::ManagerConfig;
use crate::error::ShardingError;
use crate::events::ShardingEvent;
use crate::manager_state::ShardManagerState;
use crate::metrics::ClusterMetrics;
use crate::pod::{Pod, PodWithMetadata};
use crate::pods::Pods;
use crate::pods_health::PodsHealth;
use crate::shard_assigner::{AssignmentMode, RebalanceDecision, ShardAssigner};
use crate::shard_manager_client::ShardManagerClient;
use crate::types::{PodAddress, ShardId};

const EVENT_BUFFER: usize = 64;

type ShardMap = BTreeMap<PodAddress, BTreeSet<ShardId>>;

pub struct ShardManager {
    config: ManagerConfig,
    state: ArcSwap<ShardManagerState>,
    /// Serializes read-modify-write updates of `state`.
    write_lock: parking_lot::Mutex<()>,
    rebalance_gate: Semaphore,
    persist_lock: tokio::sync::Mutex<()>,
    events: broadcast::Sender<ShardingEvent>,
    storage: Arc<dyn ClusterStorage>,
    pods: Arc<dyn Pods>,
    health: Arc<dyn PodsHealth>,
    metrics: Arc<ClusterMetrics>,
    cancel: CancellationToken,
    this: Weak<ShardManager>,
}

impl ShardManager {
    /// Loads the cluster state from storage and starts the background loops.
    ///
    /// Stored pods that the health probe does not report alive are dropped,
    /// along with their shard assignments.
    #[instrument(skip_all, fields(shards = config.number_of_shards))]
    pub async fn start(
        config: ManagerConfig,
        storage: Arc<dyn ClusterStorage>,
        pods: Arc<dyn Pods>,
        health: Arc<dyn PodsHealth>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Arc<Self>, ShardingError> {
        config.validate()?;

        let stored_pods = storage.get_pods().await?;
        let probes = stored_pods.into_iter().map(|pod| {
            let health = Arc::clone(&health);
            async move {
                match health.is_alive(&pod.address).await {
                    Ok(true) => Some(pod),
                    Ok(false) => {
                        tracing::info!(pod = %pod.address, "dropping stored pod that is not alive");
                        None
                    }
                    Err(err) => {
                        tracing::warn!(pod = %pod.address, error = %err, "health probe failed, dropping stored pod");
                        None
                    }
                }
            }
        });
        let now = Utc::now();
        let live_pods: HashMap<PodAddress, PodWithMetadata> = join_all(probes)
            .await
            .into_iter()
            .flatten()
            .map(|pod| (pod.address.clone(), PodWithMetadata::new(pod, now)))
            .collect();

        let stored_assignments = storage.get_assignments().await?;
        let mut shards: Assignments = ShardId::all(config.number_of_shards)
            .map(|shard| (shard, None))
            .collect();
        for (shard, owner) in stored_assignments {
            let owner = owner.filter(|owner| live_pods.contains_key(owner));
            if let Some(slot) = shards.get_mut(&shard) {
                *slot = owner;
            }
        }

        let state = ShardManagerState::new(live_pods, shards);
        tracing::info!(
            pods = state.pods().len(),
            unassigned = state.unassigned_shards().len(),
            "shard manager state loaded"
        );

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let manager = Arc::new_cyclic(|this| Self {
            config,
            state: ArcSwap::from_pointee(state),
            write_lock: parking_lot::Mutex::new(()),
            rebalance_gate: Semaphore::new(1),
            persist_lock: tokio::sync::Mutex::new(()),
            events,
            storage,
            pods,
            health,
            metrics,
            cancel: CancellationToken::new(),
            this: this.clone(),
        });
        manager.update_metrics(&manager.state.load());
        manager.spawn_background_tasks();
        Ok(manager)
    }

    /// Current snapshot of the cluster state.
    pub fn state(&self) -> Arc<ShardManagerState> {
        self.state.load_full()
    }

    pub fn get_assignments(&self) -> Assignments {
        self.state.load().shards().clone()
    }

    /// Lifecycle events from now on. A subscriber that falls behind skips
    /// the events it missed.
    pub fn get_sharding_events(&self) -> Pin<Box<dyn Stream<Item = ShardingEvent> + Send>> {
        let stream = BroadcastStream::new(self.events.subscribe());
        Box::pin(stream.filter_map(|r: Result<ShardingEvent, _>| {
            futures::future::ready(match r {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(count)) => {
                    tracing::warn!(lagged_count = count, "sharding event subscriber lagged");
                    None
                }
            })
        }))
    }

    #[instrument(skip(self, pod), fields(pod = %pod.address, version = %pod.version))]
    pub async fn register(&self, pod: Pod) -> Result<(), ShardingError> {
        if self.cancel.is_cancelled() {
            return Err(ShardingError::ShuttingDown);
        }
        tracing::info!("registering pod");
        let address = pod.address.clone();
        let has_unassigned = {
            let _guard = self.write_lock.lock();
            let next = self
                .state
                .load()
                .with_pod(PodWithMetadata::new(pod, Utc::now()));
            let has_unassigned = !next.unassigned_shards().is_empty();
            self.store(next);
            has_unassigned
        };
        self.spawn_persist_pods();
        self.publish(ShardingEvent::PodRegistered { pod: address });
        if has_unassigned {
            self.spawn_rebalance(false, None);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn unregister(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        if self.cancel.is_cancelled() {
            return Err(ShardingError::ShuttingDown);
        }
        let released = {
            let _guard = self.write_lock.lock();
            let current = self.state.load();
            if !current.pods().contains_key(pod) {
                tracing::debug!("ignoring unregistration of unknown pod");
                return Ok(());
            }
            let (next, released) = current.without_pod(pod);
            self.store(next);
            released
        };
        tracing::info!(released = released.len(), "unregistered pod");

        if !released.is_empty() {
            self.publish(ShardingEvent::ShardsUnassigned {
                pod: pod.clone(),
                shards: released,
            });
            self.spawn_persist_assignments();
        }
        self.publish(ShardingEvent::PodUnregistered { pod: pod.clone() });
        self.spawn_persist_pods();
        self.spawn_rebalance(true, None);
        Ok(())
    }

    /// Probes a pod reported as failing and unregisters it if it is dead.
    /// Probe errors leave the pod registered.
    #[instrument(skip(self))]
    pub async fn notify_unhealthy_pod(&self, pod: &PodAddress) {
        if !self.state.load().pods().contains_key(pod) {
            return;
        }
        self.publish(ShardingEvent::PodHealthChecked { pod: pod.clone() });
        match self.health.is_alive(pod).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("pod is not alive, unregistering");
                if let Err(err) = self.unregister(pod).await {
                    tracing::warn!(error = %err, "failed to unregister dead pod");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "health probe failed");
            }
        }
    }

    pub async fn check_all_pods_health(&self) {
        let pods: Vec<PodAddress> = self.state.load().pods().keys().cloned().collect();
        futures::stream::iter(pods)
            .for_each_concurrent(self.config.health_check_concurrency, |pod| async move {
                self.notify_unhealthy_pod(&pod).await;
            })
            .await;
    }

    /// Computes and applies one rebalance pass.
    ///
    /// Unassigned-first mode runs when `immediate` is set or some shard has
    /// no owner; otherwise balance mode. Pods that miss the ping are left
    /// out of this pass. Unassignments are acknowledged and persisted before
    /// any shard is handed to its new owner.
    #[instrument(skip(self))]
    pub async fn rebalance(&self, immediate: bool) {
        let Ok(_permit) = self.rebalance_gate.acquire().await else {
            return;
        };

        let state = self.state.load_full();
        let mode = if immediate || !state.unassigned_shards().is_empty() {
            AssignmentMode::UnassignedFirst
        } else {
            AssignmentMode::Balance {
                rebalance_rate: self.config.rebalance_rate,
            }
        };
        let RebalanceDecision {
            assignments,
            unassignments,
        } = ShardAssigner::decide(&state, mode);
        if assignments.is_empty() && unassignments.is_empty() {
            return;
        }
        tracing::debug!(?mode, "rebalancing");

        let referenced: BTreeSet<PodAddress> =
            assignments.keys().chain(unassignments.keys()).cloned().collect();
        let pings = referenced.iter().map(|pod| async move {
            let alive = matches!(
                tokio::time::timeout(self.config.ping_timeout, self.pods.ping(pod)).await,
                Ok(Ok(()))
            );
            (pod.clone(), alive)
        });
        let failed_pinged: BTreeSet<PodAddress> = join_all(pings)
            .await
            .into_iter()
            .filter(|(_, alive)| !alive)
            .map(|(pod, _)| pod)
            .collect();

        let shards_of_failed: BTreeSet<ShardId> = assignments
            .iter()
            .chain(unassignments.iter())
            .filter(|(pod, _)| failed_pinged.contains(*pod))
            .flat_map(|(_, shards)| shards.iter().copied())
            .collect();
        let ready_assignments = without_shards(assignments, &shards_of_failed);
        let ready_unassignments = without_shards(unassignments, &shards_of_failed);

        let mut failed_unassigned_pods = BTreeSet::new();
        let mut failed_unassigned_shards = BTreeSet::new();
        let mut any_unassigned = false;
        let results = join_all(ready_unassignments.iter().map(|(pod, shards)| async move {
            let result = match self
                .bounded_pod_call(pod, self.pods.unassign_shards(pod, shards))
                .await
            {
                Ok(()) => self.update_shards_state(shards, None),
                Err(err) => Err(err),
            };
            (pod, shards, result)
        }))
        .await;
        for (pod, shards, result) in results {
            match result {
                Ok(()) => {
                    any_unassigned = true;
                    self.publish(ShardingEvent::ShardsUnassigned {
                        pod: pod.clone(),
                        shards: shards.clone(),
                    });
                }
                Err(err) => {
                    tracing::warn!(pod = %pod, error = %err, "failed to unassign shards");
                    failed_unassigned_pods.insert(pod.clone());
                    failed_unassigned_shards.extend(shards.iter().copied());
                }
            }
        }
        if any_unassigned {
            self.persist_assignments().await;
        }

        let filtered_assignments: ShardMap = ready_assignments
            .into_iter()
            .filter(|(pod, _)| !failed_unassigned_pods.contains(pod))
            .map(|(pod, shards)| {
                let shards: BTreeSet<ShardId> =
                    shards.difference(&failed_unassigned_shards).copied().collect();
                (pod, shards)
            })
            .filter(|(_, shards)| !shards.is_empty())
            .collect();

        let results = join_all(filtered_assignments.iter().map(|(pod, shards)| async move {
            let result = match self
                .bounded_pod_call(pod, self.pods.assign_shards(pod, shards))
                .await
            {
                Ok(()) => self.update_shards_state(shards, Some(pod)),
                Err(err) => Err(err),
            };
            (pod, shards, result)
        }))
        .await;
        let mut failed_assigned_pods = BTreeSet::new();
        for (pod, shards, result) in results {
            match result {
                Ok(()) => self.publish(ShardingEvent::ShardsAssigned {
                    pod: pod.clone(),
                    shards: shards.clone(),
                }),
                Err(err) => {
                    tracing::warn!(pod = %pod, error = %err, "failed to assign shards");
                    failed_assigned_pods.insert(pod.clone());
                }
            }
        }

        let failed: BTreeSet<PodAddress> = failed_pinged
            .iter()
            .chain(failed_unassigned_pods.iter())
            .chain(failed_assigned_pods.iter())
            .cloned()
            .collect();
        if !failed.is_empty() {
            tracing::debug!(
                failed = ?failed,
                failed_pinged = ?failed_pinged,
                failed_unassigned = ?failed_unassigned_pods,
                failed_assigned = ?failed_assigned_pods,
                "rebalance had failed pods"
            );
            for pod in &failed {
                self.spawn_health_check(pod.clone());
            }
            if immediate {
                self.spawn_rebalance(true, Some(self.config.rebalance_retry_interval));
            }
        }

        self.spawn_persist_assignments();
    }

    /// Stops the background loops. In-flight operations finish on their own;
    /// later registrations and unregistrations fail with
    /// [`ShardingError::ShuttingDown`].
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn bounded_pod_call<Fut>(&self, pod: &PodAddress, call: Fut) -> Result<(), ShardingError>
    where
        Fut: Future<Output = Result<(), ShardingError>>,
    {
        let timeout = self.config.pod_operation_timeout;
        match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(pod = %pod, timeout_ms = timeout.as_millis() as u64, "pod did not acknowledge in time");
                Err(ShardingError::unavailable(pod))
            }
        }
    }

    fn update_shards_state(
        &self,
        shards: &BTreeSet<ShardId>,
        owner: Option<&PodAddress>,
    ) -> Result<(), ShardingError> {
        let _guard = self.write_lock.lock();
        let current = self.state.load();
        if let Some(pod) = owner {
            if !current.pods().contains_key(pod) {
                return Err(ShardingError::PodNoLongerRegistered {
                    address: pod.clone(),
                });
            }
        }
        let next = current.with_shards(shards, owner);
        self.store(next);
        Ok(())
    }

    fn store(&self, next: ShardManagerState) {
        self.update_metrics(&next);
        self.state.store(Arc::new(next));
    }

    fn update_metrics(&self, state: &ShardManagerState) {
        self.metrics.pods.set(state.pods().len() as i64);
        self.metrics
            .unassigned_shards
            .set(state.unassigned_shards().len() as i64);
    }

    fn publish(&self, event: ShardingEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn persist_assignments(&self) {
        let _guard = self.persist_lock.lock().await;
        let assignments = self.state.load().shards().clone();
        self.with_retry("assignments", || {
            self.storage.save_assignments(assignments.clone())
        })
        .await;
    }

    async fn persist_pods(&self) {
        let _guard = self.persist_lock.lock().await;
        let mut pods: Vec<Pod> = self
            .state
            .load()
            .pods()
            .values()
            .map(|pod| pod.pod.clone())
            .collect();
        pods.sort_by(|a, b| a.address.cmp(&b.address));
        self.with_retry("pods", || self.storage.save_pods(pods.clone()))
            .await;
    }

    /// Retries `op` up to `persist_retry_count` times. Exhausted retries are
    /// logged and dropped; the in-memory state stays authoritative.
    async fn with_retry<F, Fut>(&self, what: &str, mut op: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ShardingError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(()) => return,
                Err(err) if attempt < self.config.persist_retry_count => {
                    attempt += 1;
                    tracing::debug!(what, attempt, error = %err, "persisting failed, retrying");
                    tokio::time::sleep(self.config.persist_retry_interval).await;
                }
                Err(err) => {
                    tracing::error!(what, attempts = attempt + 1, error = %err, "giving up persisting");
                    return;
                }
            }
        }
    }

    fn spawn_rebalance(&self, immediate: bool, delay: Option<Duration>) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            manager.rebalance(immediate).await;
        });
    }

    fn spawn_health_check(&self, pod: PodAddress) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.notify_unhealthy_pod(&pod).await;
        });
    }

    fn spawn_persist_assignments(&self) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.persist_assignments().await;
        });
    }

    fn spawn_persist_pods(&self) {
        let Some(manager) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            manager.persist_pods().await;
        });
    }

    fn spawn_background_tasks(&self) {
        let cancel = self.cancel.clone();
        let this = self.this.clone();
        let interval = self.config.rebalance_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = this.upgrade() else { break };
                        manager.rebalance(false).await;
                    }
                }
            }
        });

        let cancel = self.cancel.clone();
        let this = self.this.clone();
        let interval = self.config.pod_health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = this.upgrade() else { break };
                        manager.check_all_pods_health().await;
                    }
                }
            }
        });

        let cancel = self.cancel.clone();
        let mut events = self.get_sharding_events();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => tracing::debug!(%event, "sharding event"),
                        None => break,
                    },
                }
            }
        });
    }
}

fn without_shards(map: ShardMap, excluded: &BTreeSet<ShardId>) -> ShardMap {
    map.into_iter()
        .map(|(pod, shards)| {
            let shards: BTreeSet<ShardId> = shards.difference(excluded).copied().collect();
            (pod, shards)
        })
        .filter(|(_, shards)| !shards.is_empty())
        .collect()
}

#[async_trait]
impl ShardManagerClient for ShardManager {
    async fn register(&self, pod: Pod) -> Result<(), ShardingError> {
        ShardManager::register(self, pod).await
    }

    async fn unregister(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        ShardManager::unregister(self, pod).await
    }

    async fn notify_unhealthy_pod(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        // Report and return; the probe may take a while.
        self.spawn_health_check(pod.clone());
        Ok(())
    }

    async fn get_assignments(&self) -> Result<Assignments, ShardingError> {
        Ok(ShardManager::get_assignments(self))
    }
}

impl Drop for ShardManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
