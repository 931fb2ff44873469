//! Per-recipient-type entity lifecycle on one pod.
//!
//! An [`EntityManager`] lazily starts one behaviour instance per entity id
//! on first delivery, evicts instances after `entity_max_idle_time` without
//! messages, and terminates instances when their shard leaves the pod.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, Shared};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::behaviour::{Delivery, Mailbox, RecipientBehaviour, RecipientContext};
use crate::config::ShardingConfig;
use crate::error::ShardingError;
use crate::message::{decode, Message};
use crate::metrics::ClusterMetrics;
use crate::recipient::{RecipientKind, RecipientType};
use crate::reply::PendingReplies;
use crate::shard_cache::ShardCache;
use crate::types::{EntityId, ShardId};

type Termination = Shared<BoxFuture<'static, ()>>;

/// Runtime state of one live entity instance.
struct EntityState<Msg> {
    /// Closed when the instance terminates. Cancels the behaviour and every
    /// task it spawned.
    scope: CancellationToken,
    sender: mpsc::UnboundedSender<Delivery<Msg>>,
    task: Option<JoinHandle<()>>,
    expiration: Option<JoinHandle<()>>,
    /// Set once termination started. Concurrent terminations await the same
    /// future, and sends back off until the entry is gone.
    termination: Option<Termination>,
    last_received_at: Arc<parking_lot::Mutex<Instant>>,
}

/// Handle to a live instance, cloned out of the map so no map lock is held
/// while delivering.
struct LiveEntity<Msg> {
    scope: CancellationToken,
    sender: mpsc::UnboundedSender<Delivery<Msg>>,
    last_received_at: Arc<parking_lot::Mutex<Instant>>,
}

pub struct EntityManager<Msg> {
    inner: Arc<Inner<Msg>>,
}

struct Inner<Msg> {
    recipient_type: RecipientType<Msg>,
    behaviour: RecipientBehaviour<Msg>,
    config: Arc<ShardingConfig>,
    cache: Arc<ShardCache>,
    replies: Arc<PendingReplies>,
    entities: DashMap<EntityId, EntityState<Msg>>,
    metrics: Arc<ClusterMetrics>,
}

impl<Msg: Message> EntityManager<Msg> {
    pub(crate) fn new(
        recipient_type: RecipientType<Msg>,
        behaviour: RecipientBehaviour<Msg>,
        config: Arc<ShardingConfig>,
        cache: Arc<ShardCache>,
        replies: Arc<PendingReplies>,
        metrics: Arc<ClusterMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                recipient_type,
                behaviour,
                config,
                cache,
                replies,
                entities: DashMap::new(),
                metrics,
            }),
        }
    }

    pub fn recipient_type(&self) -> &RecipientType<Msg> {
        &self.inner.recipient_type
    }

    /// Enqueues `msg` for `entity_id`, starting the instance if needed.
    ///
    /// Returns the instance's scope token so callers waiting for a reply can
    /// stop waiting when the instance goes away. Fails with
    /// `EntityNotManagedByThisPod` when the entity's shard is not local or
    /// the pod is shutting down. An instance whose mailbox is closed is
    /// restarted once; if the restarted one rejects the message too, the
    /// instance is terminated and `EntityMailboxClosed` returned.
    pub async fn send(&self, entity_id: EntityId, msg: Msg) -> Result<CancellationToken, ShardingError> {
        let mut delivery = Delivery::Message(msg);
        let mut restarted = false;
        loop {
            self.inner.check_managed(&entity_id)?;

            let Some(live) = self.inner.get_or_create(&entity_id) else {
                // Previous instance still terminating.
                tokio::time::sleep(self.inner.config.entity_restart_backoff).await;
                continue;
            };

            *live.last_received_at.lock() = Instant::now();
            match live.sender.send(delivery) {
                Ok(()) => return Ok(live.scope),
                Err(mpsc::error::SendError(_)) if restarted => {
                    tracing::warn!(
                        entity_id = %entity_id,
                        recipient_type = %self.inner.recipient_type,
                        "restarted entity dropped its mailbox, terminating it"
                    );
                    let _ = self.inner.fork_termination(&entity_id);
                    return Err(ShardingError::EntityMailboxClosed { entity_id });
                }
                Err(mpsc::error::SendError(returned)) => {
                    tracing::debug!(
                        entity_id = %entity_id,
                        recipient_type = %self.inner.recipient_type,
                        "entity behaviour ended, restarting instance"
                    );
                    delivery = returned;
                    restarted = true;
                    let _ = self.inner.fork_termination(&entity_id);
                    tokio::time::sleep(self.inner.config.entity_restart_backoff).await;
                }
            }
        }
    }

    /// Terminates one instance. Returns once it is gone.
    pub async fn terminate_entity(&self, entity_id: &EntityId) {
        if let Some(termination) = self.inner.fork_termination(entity_id) {
            termination.await;
        }
    }

    /// Terminates every instance whose entity id hashes to one of `shards`.
    pub async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>) {
        let ids: Vec<EntityId> = self
            .inner
            .entities
            .iter()
            .filter(|entry| shards.contains(&self.inner.cache.shard_id(entry.key())))
            .map(|entry| entry.key().clone())
            .collect();
        self.inner.terminate_many(ids).await;
    }

    pub async fn terminate_all_entities(&self) {
        let ids: Vec<EntityId> = self
            .inner
            .entities
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        self.inner.terminate_many(ids).await;
    }

    /// Live instances, including ones being terminated.
    pub fn entity_count(&self) -> usize {
        self.inner.entities.len()
    }

    pub fn is_running(&self, entity_id: &EntityId) -> bool {
        self.inner
            .entities
            .get(entity_id)
            .is_some_and(|state| state.termination.is_none())
    }
}

impl<Msg: Message> Inner<Msg> {
    fn check_managed(&self, entity_id: &EntityId) -> Result<(), ShardingError> {
        let local = match self.recipient_type.kind() {
            RecipientKind::Entity => self.cache.is_entity_on_local_shards(entity_id),
            RecipientKind::Topic => true,
        };
        if !local || self.cache.is_shutting_down() {
            return Err(ShardingError::EntityNotManagedByThisPod {
                entity_id: entity_id.clone(),
            });
        }
        Ok(())
    }

    /// Returns the live instance, starting one if absent. `None` while a
    /// previous instance is terminating.
    fn get_or_create(self: &Arc<Self>, entity_id: &EntityId) -> Option<LiveEntity<Msg>> {
        match self.entities.entry(entity_id.clone()) {
            Entry::Occupied(entry) => {
                let state = entry.get();
                if state.termination.is_some() {
                    return None;
                }
                Some(LiveEntity {
                    scope: state.scope.clone(),
                    sender: state.sender.clone(),
                    last_received_at: Arc::clone(&state.last_received_at),
                })
            }
            Entry::Vacant(entry) => {
                let state = self.start_entity(entity_id);
                let live = LiveEntity {
                    scope: state.scope.clone(),
                    sender: state.sender.clone(),
                    last_received_at: Arc::clone(&state.last_received_at),
                };
                entry.insert(state);
                self.metrics.entities.inc();
                Some(live)
            }
        }
    }

    fn start_entity(self: &Arc<Self>, entity_id: &EntityId) -> EntityState<Msg> {
        let scope = CancellationToken::new();
        let (sender, receiver) = mpsc::unbounded_channel();
        let ctx = RecipientContext::new(
            entity_id.clone(),
            self.recipient_type.name().to_string(),
            scope.clone(),
            Arc::clone(&self.replies),
        );
        let behaviour = (self.behaviour)(ctx, Mailbox::new(receiver));
        let task_scope = scope.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = task_scope.cancelled() => {}
                _ = behaviour => {}
            }
            // Once the behaviour returns, its children and pending replies
            // go with it.
            task_scope.cancel();
        });

        let last_received_at = Arc::new(parking_lot::Mutex::new(Instant::now()));
        let expiration = tokio::spawn(watch_expiration(
            Arc::downgrade(self),
            entity_id.clone(),
            Arc::clone(&last_received_at),
            self.config.entity_max_idle_time,
        ));

        tracing::debug!(
            entity_id = %entity_id,
            recipient_type = %self.recipient_type,
            "started entity"
        );

        EntityState {
            scope,
            sender,
            task: Some(task),
            expiration: Some(expiration),
            termination: None,
            last_received_at,
        }
    }

    /// Starts terminating an instance, or joins a termination in progress.
    ///
    /// The instance first gets a poison pill and `entity_termination_timeout`
    /// to finish on its own. After that its scope is closed and the task
    /// aborted. The entry is removed last.
    fn fork_termination(self: &Arc<Self>, entity_id: &EntityId) -> Option<Termination> {
        let mut state = self.entities.get_mut(entity_id)?;
        if let Some(termination) = &state.termination {
            return Some(termination.clone());
        }
        if let Some(expiration) = state.expiration.take() {
            expiration.abort();
        }

        let scope = state.scope.clone();
        let sender = state.sender.clone();
        let task = state.task.take();
        let timeout = self.config.entity_termination_timeout;
        let inner = Arc::downgrade(self);
        let id = entity_id.clone();
        let recipient_type = self.recipient_type.name().to_string();

        let handle = tokio::spawn(async move {
            let _ = sender.send(Delivery::PoisonPill);
            if let Some(mut task) = task {
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) if err.is_panic() => {
                        tracing::error!(entity_id = %id, recipient_type = %recipient_type, "entity behaviour panicked");
                    }
                    Ok(Err(_)) => {}
                    Err(_) => {
                        tracing::warn!(
                            entity_id = %id,
                            recipient_type = %recipient_type,
                            timeout = ?timeout,
                            "entity did not stop in time, interrupting"
                        );
                        scope.cancel();
                        task.abort();
                    }
                }
            }
            scope.cancel();
            if let Some(inner) = inner.upgrade() {
                if inner.entities.remove(&id).is_some() {
                    inner.metrics.entities.dec();
                }
            }
            tracing::debug!(entity_id = %id, recipient_type = %recipient_type, "terminated entity");
        });

        let termination = async move {
            let _ = handle.await;
        }
        .boxed()
        .shared();
        state.termination = Some(termination.clone());
        Some(termination)
    }

    async fn terminate_many(self: &Arc<Self>, ids: Vec<EntityId>) {
        let outer = self.config.entity_termination_timeout * 2;
        let terminations = ids.into_iter().filter_map(|id| {
            let termination = self.fork_termination(&id)?;
            Some(async move {
                if tokio::time::timeout(outer, termination).await.is_err() {
                    tracing::warn!(entity_id = %id, "entity termination timed out");
                }
            })
        });
        join_all(terminations).await;
    }
}

/// Terminates the entity once it has been idle for `max_idle`.
async fn watch_expiration<Msg: Message>(
    inner: Weak<Inner<Msg>>,
    entity_id: EntityId,
    last_received_at: Arc<parking_lot::Mutex<Instant>>,
    max_idle: std::time::Duration,
) {
    loop {
        let deadline = *last_received_at.lock() + max_idle;
        tokio::time::sleep_until(deadline).await;
        if last_received_at.lock().elapsed() >= max_idle {
            break;
        }
    }
    if let Some(inner) = inner.upgrade() {
        tracing::debug!(entity_id = %entity_id, recipient_type = %inner.recipient_type, "entity idle, terminating");
        // The termination aborts this task; it runs on its own.
        let _ = inner.fork_termination(&entity_id);
    }
}

/// Type-erased view of an [`EntityManager`] used by the pod's recipient table.
#[async_trait]
pub(crate) trait LocalRecipient: Send + Sync {
    fn kind(&self) -> RecipientKind;

    /// Decodes `body` and enqueues it. Returns the instance's scope token.
    async fn send_binary(
        &self,
        entity_id: EntityId,
        body: &[u8],
    ) -> Result<CancellationToken, ShardingError>;

    async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>);

    async fn terminate_all_entities(&self);

    fn entity_count(&self) -> usize;
}

#[async_trait]
impl<Msg: Message> LocalRecipient for EntityManager<Msg> {
    fn kind(&self) -> RecipientKind {
        self.inner.recipient_type.kind()
    }

    async fn send_binary(
        &self,
        entity_id: EntityId,
        body: &[u8],
    ) -> Result<CancellationToken, ShardingError> {
        let msg: Msg = decode(body)?;
        self.send(entity_id, msg).await
    }

    async fn terminate_entities_on_shards(&self, shards: &BTreeSet<ShardId>) {
        // Topic instances are per pod, not per shard.
        if self.kind() == RecipientKind::Entity {
            EntityManager::terminate_entities_on_shards(self, shards).await;
        }
    }

    async fn terminate_all_entities(&self) {
        EntityManager::terminate_all_entities(self).await;
    }

    fn entity_count(&self) -> usize {
        EntityManager::entity_count(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviour::behaviour;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn config() -> Arc<ShardingConfig> {
        Arc::new(ShardingConfig {
            number_of_shards: 10,
            entity_max_idle_time: Duration::from_secs(60),
            entity_termination_timeout: Duration::from_secs(1),
            entity_restart_backoff: Duration::from_millis(10),
            ..ShardingConfig::default()
        })
    }

    fn local_cache(config: &ShardingConfig) -> Arc<ShardCache> {
        let cache = Arc::new(ShardCache::new(config.address.clone(), config.number_of_shards));
        cache.assign(&ShardId::all(config.number_of_shards).collect());
        cache
    }

    /// Records every message and stops on a poison pill.
    fn recording(
        config: Arc<ShardingConfig>,
        cache: Arc<ShardCache>,
        received: Arc<parking_lot::Mutex<Vec<(String, u32)>>>,
        starts: Arc<AtomicUsize>,
    ) -> EntityManager<u32> {
        EntityManager::new(
            RecipientType::entity("Counter"),
            behaviour(move |ctx: RecipientContext, mut mailbox: Mailbox<u32>| {
                let received = Arc::clone(&received);
                starts.fetch_add(1, Ordering::SeqCst);
                async move {
                    while let Some(msg) = mailbox.recv().await {
                        received.lock().push((ctx.entity_id().to_string(), msg));
                    }
                }
            }),
            config,
            cache,
            Arc::new(PendingReplies::new()),
            Arc::new(ClusterMetrics::unregistered()),
        )
    }

    #[tokio::test]
    async fn instances_are_isolated_per_entity_id() {
        let config = config();
        let cache = local_cache(&config);
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let starts = Arc::new(AtomicUsize::new(0));
        let manager = recording(config, cache, Arc::clone(&received), Arc::clone(&starts));

        manager.send(EntityId::new("entity1"), 1).await.unwrap();
        manager.send(EntityId::new("entity2"), 2).await.unwrap();
        manager.send(EntityId::new("entity1"), 3).await.unwrap();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.entity_count(), 2);
        assert_eq!(starts.load(Ordering::SeqCst), 2);
        let received = received.lock().clone();
        let entity1: Vec<u32> = received.iter().filter(|(id, _)| id == "entity1").map(|(_, m)| *m).collect();
        assert_eq!(entity1, vec![1, 3]);
    }

    #[tokio::test]
    async fn rejects_entities_on_foreign_shards() {
        let config = config();
        let cache = Arc::new(ShardCache::new(config.address.clone(), config.number_of_shards));
        let manager = recording(
            config,
            cache,
            Arc::new(parking_lot::Mutex::new(Vec::new())),
            Arc::new(AtomicUsize::new(0)),
        );
        let err = manager.send(EntityId::new("entity1"), 1).await.unwrap_err();
        assert!(matches!(err, ShardingError::EntityNotManagedByThisPod { .. }));
        assert_eq!(manager.entity_count(), 0);
    }

    #[tokio::test]
    async fn rejects_everything_while_shutting_down() {
        let config = config();
        let cache = local_cache(&config);
        cache.set_shutting_down(true);
        let manager = recording(
            config,
            cache,
            Arc::new(parking_lot::Mutex::new(Vec::new())),
            Arc::new(AtomicUsize::new(0)),
        );
        assert!(manager.send(EntityId::new("entity1"), 1).await.is_err());
    }

    #[tokio::test]
    async fn terminate_entities_on_shards_only_hits_those_shards() {
        let config = config();
        let cache = local_cache(&config);
        let manager = recording(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::new(parking_lot::Mutex::new(Vec::new())),
            Arc::new(AtomicUsize::new(0)),
        );

        let ids: Vec<EntityId> = (0..20).map(|i| EntityId::new(format!("e-{i}"))).collect();
        for id in &ids {
            manager.send(id.clone(), 0).await.unwrap();
        }
        let target = cache.shard_id(&ids[0]);
        let expected_left = ids.iter().filter(|id| cache.shard_id(id) != target).count();

        manager.terminate_entities_on_shards(&BTreeSet::from([target])).await;
        assert_eq!(manager.entity_count(), expected_left);
        assert!(!manager.is_running(&ids[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn stubborn_behaviour_is_interrupted_after_timeout() {
        let config = config();
        let cache = local_cache(&config);
        let manager = EntityManager::new(
            RecipientType::<u32>::entity("Stubborn"),
            behaviour(|_ctx: RecipientContext, mailbox: Mailbox<u32>| async move {
                let _keep = mailbox;
                futures::future::pending::<()>().await;
            }),
            Arc::clone(&config),
            cache,
            Arc::new(PendingReplies::new()),
            Arc::new(ClusterMetrics::unregistered()),
        );
        let id = EntityId::new("stubborn");
        let scope = manager.send(id.clone(), 1).await.unwrap();

        let started = Instant::now();
        manager.terminate_entity(&id).await;
        assert!(started.elapsed() >= config.entity_termination_timeout);
        assert!(scope.is_cancelled());
        assert_eq!(manager.entity_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn behaviour_that_drops_its_mailbox_fails_the_send() {
        let config = config();
        let cache = local_cache(&config);
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let manager = EntityManager::new(
            RecipientType::<u32>::entity("Deaf"),
            behaviour(move |_ctx: RecipientContext, _mailbox: Mailbox<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                futures::future::pending::<()>()
            }),
            Arc::clone(&config),
            cache,
            Arc::new(PendingReplies::new()),
            Arc::new(ClusterMetrics::unregistered()),
        );
        let id = EntityId::new("deaf");

        let result = tokio::time::timeout(Duration::from_secs(60), manager.send(id.clone(), 1))
            .await
            .expect("send must give up on a closed mailbox");
        assert!(matches!(result, Err(ShardingError::EntityMailboxClosed { .. })));
        assert_eq!(starts.load(Ordering::SeqCst), 2);

        tokio::time::sleep(config.entity_termination_timeout * 2).await;
        assert_eq!(manager.entity_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_entities_are_evicted() {
        let config = Arc::new(ShardingConfig {
            entity_max_idle_time: Duration::from_secs(5),
            ..(*config()).clone()
        });
        let cache = local_cache(&config);
        let starts = Arc::new(AtomicUsize::new(0));
        let manager = recording(
            config,
            cache,
            Arc::new(parking_lot::Mutex::new(Vec::new())),
            Arc::clone(&starts),
        );
        let id = EntityId::new("idle");

        manager.send(id.clone(), 1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        manager.send(id.clone(), 2).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(manager.is_running(&id), "activity resets the idle clock");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(manager.entity_count(), 0);

        manager.send(id.clone(), 3).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn finished_behaviour_is_restarted_on_next_message() {
        let config = config();
        let cache = local_cache(&config);
        let starts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&starts);
        let manager = EntityManager::new(
            RecipientType::<u32>::entity("OneShot"),
            behaviour(move |_ctx: RecipientContext, mut mailbox: Mailbox<u32>| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    mailbox.recv().await;
                }
            }),
            config,
            cache,
            Arc::new(PendingReplies::new()),
            Arc::new(ClusterMetrics::unregistered()),
        );
        let id = EntityId::new("one-shot");
        let scope = manager.send(id.clone(), 1).await.unwrap();
        scope.cancelled().await;

        manager.send(id.clone(), 2).await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }
}
