//! The sharding runtime of one pod.
//!
//! [`Sharding`] owns the pod's shard cache, its registered recipient types
//! and singletons, and the pending replies of entities it hosts. It routes
//! messages to the pod owning the target shard, delivering locally through
//! the recipient's [`EntityManager`] or remotely through [`Pods`].

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::join_all;
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::behaviour::{Mailbox, RecipientContext};
use crate::cluster_storage::ClusterStorage;
use crate::config::ShardingConfig;
use crate::entity_manager::{EntityManager, LocalRecipient};
use crate::error::ShardingError;
use crate::events::ShardingRegistrationEvent;
use crate::message::{BinaryMessage, ByteStream, Message};
use crate::messenger::{Broadcaster, Messenger};
use crate::metrics::ClusterMetrics;
use crate::pod::Pod;
use crate::pods::Pods;
use crate::recipient::{RecipientKind, RecipientType};
use crate::reply::{PendingReplies, PendingReplyGuard};
use crate::shard_cache::ShardCache;
use crate::shard_manager_client::ShardManagerClient;
use crate::singleton::{singleton_run, SingletonContext, Singletons};
use crate::types::{EntityId, PodAddress, ReplyId, ReplyIdGenerator, ShardId};

const EVENT_BUFFER: usize = 64;

pub struct Sharding {
    config: Arc<ShardingConfig>,
    cache: Arc<ShardCache>,
    pods: Arc<dyn Pods>,
    shard_manager: Arc<dyn ShardManagerClient>,
    storage: Arc<dyn ClusterStorage>,
    /// Local handlers, keyed by recipient type name.
    recipients: DashMap<String, Arc<dyn LocalRecipient>>,
    replies: Arc<PendingReplies>,
    reply_ids: ReplyIdGenerator,
    singletons: Singletons,
    registration_events: broadcast::Sender<ShardingRegistrationEvent>,
    metrics: Arc<ClusterMetrics>,
    /// Cancels the assignment refresh loop while it runs.
    refresh: parking_lot::Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
    this: Weak<Sharding>,
}

impl Sharding {
    pub fn new(
        config: ShardingConfig,
        pods: Arc<dyn Pods>,
        shard_manager: Arc<dyn ShardManagerClient>,
        storage: Arc<dyn ClusterStorage>,
        metrics: Arc<ClusterMetrics>,
    ) -> Result<Arc<Self>, ShardingError> {
        config.validate()?;
        let cache = Arc::new(ShardCache::new(
            config.address.clone(),
            config.number_of_shards,
        ));
        let reply_ids = ReplyIdGenerator::new(&config.address);
        let singletons = Singletons::new(config.entity_termination_timeout);
        let (registration_events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Arc::new_cyclic(|this| Self {
            config: Arc::new(config),
            cache,
            pods,
            shard_manager,
            storage,
            recipients: DashMap::new(),
            replies: Arc::new(PendingReplies::new()),
            reply_ids,
            singletons,
            registration_events,
            metrics,
            refresh: parking_lot::Mutex::new(None),
            cancel: CancellationToken::new(),
            this: this.clone(),
        }))
    }

    pub fn address(&self) -> &PodAddress {
        &self.config.address
    }

    pub fn config(&self) -> &ShardingConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cache.is_shutting_down()
    }

    pub fn shard_id(&self, entity_id: &EntityId) -> ShardId {
        self.cache.shard_id(entity_id)
    }

    pub fn is_entity_on_local_shards(&self, entity_id: &EntityId) -> bool {
        self.cache.is_entity_on_local_shards(entity_id)
    }

    /// Shards this pod currently owns.
    pub fn local_shards(&self) -> BTreeSet<ShardId> {
        self.cache.local_shards()
    }

    /// Owner of `shard` as this pod knows it.
    pub fn shard_owner(&self, shard: ShardId) -> Option<PodAddress> {
        self.cache.owner(shard)
    }

    /// Number of shards with a known owner.
    pub fn known_shards(&self) -> usize {
        self.cache.len()
    }

    /// Live entity instances across all recipient types.
    pub fn entity_count(&self) -> usize {
        self.recipients
            .iter()
            .map(|recipient| recipient.value().entity_count())
            .sum()
    }

    pub(crate) fn cache(&self) -> &ShardCache {
        &self.cache
    }

    pub(crate) fn next_reply_id(&self) -> ReplyId {
        self.reply_ids.next_id()
    }

    /// Joins the cluster: clears the shutting-down flag, starts following
    /// assignments and registers with the shard manager.
    #[instrument(skip(self), fields(pod = %self.config.address))]
    pub async fn register(&self) -> Result<(), ShardingError> {
        self.cache.set_shutting_down(false);
        self.start_refresh_loop();
        self.shard_manager
            .register(Pod::new(self.config.address.clone(), self.config.version.clone()))
            .await?;
        tracing::info!("registered with shard manager");
        Ok(())
    }

    /// Leaves the cluster: stops singletons, terminates every local entity,
    /// then unregisters from the shard manager.
    ///
    /// Nothing is torn down if the shard manager cannot be reached.
    #[instrument(skip(self), fields(pod = %self.config.address))]
    pub async fn unregister(&self) -> Result<(), ShardingError> {
        if let Err(err) = self.shard_manager.get_assignments().await {
            tracing::warn!(error = %err, "shard manager unreachable, not unregistering");
            return Err(err);
        }

        tracing::info!("unregistering from shard manager");
        self.cache.set_shutting_down(true);
        self.sync_singletons().await;
        self.terminate_all_entities().await;
        self.shard_manager.unregister(&self.config.address).await?;
        tracing::info!("unregistered from shard manager");
        Ok(())
    }

    /// Takes ownership of `shards`. Called by the shard manager.
    pub async fn assign(&self, shards: &BTreeSet<ShardId>) {
        if self.cache.is_shutting_down() {
            tracing::debug!(shard_count = shards.len(), "ignoring assignment while shutting down");
            return;
        }
        self.cache.assign(shards);
        self.update_shard_metrics();
        tracing::debug!(shard_count = shards.len(), "shards assigned");
        self.sync_singletons().await;
    }

    /// Gives up `shards`. Entities on them are terminated before this
    /// returns. Called by the shard manager.
    pub async fn unassign(&self, shards: &BTreeSet<ShardId>) {
        if self.cache.is_shutting_down() {
            tracing::debug!(shard_count = shards.len(), "ignoring unassignment while shutting down");
            return;
        }
        self.cache.unassign(shards);
        self.update_shard_metrics();
        tracing::debug!(shard_count = shards.len(), "shards unassigned");

        let recipients = self.recipients_snapshot();
        join_all(
            recipients
                .iter()
                .map(|recipient| recipient.terminate_entities_on_shards(shards)),
        )
        .await;
        self.sync_singletons().await;
    }

    /// Registers the handler for a sharded recipient type.
    pub fn register_entity<Msg, F, Fut>(
        &self,
        recipient_type: &RecipientType<Msg>,
        behaviour: F,
    ) -> Result<(), ShardingError>
    where
        Msg: Message,
        F: Fn(RecipientContext, Mailbox<Msg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if recipient_type.kind() != RecipientKind::Entity {
            return Err(ShardingError::InvalidConfig {
                reason: format!("{recipient_type} is a topic, not an entity type"),
            });
        }
        self.register_recipient(recipient_type, behaviour);
        self.emit(ShardingRegistrationEvent::EntityRegistered {
            name: recipient_type.name().to_string(),
        });
        Ok(())
    }

    /// Registers this pod's subscriber for a topic.
    pub fn register_topic<Msg, F, Fut>(
        &self,
        recipient_type: &RecipientType<Msg>,
        behaviour: F,
    ) -> Result<(), ShardingError>
    where
        Msg: Message,
        F: Fn(RecipientContext, Mailbox<Msg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if recipient_type.kind() != RecipientKind::Topic {
            return Err(ShardingError::InvalidConfig {
                reason: format!("{recipient_type} is an entity type, not a topic"),
            });
        }
        self.register_recipient(recipient_type, behaviour);
        self.emit(ShardingRegistrationEvent::TopicRegistered {
            name: recipient_type.name().to_string(),
        });
        Ok(())
    }

    /// Registers a computation that runs on exactly one pod of the cluster,
    /// the owner of shard 1.
    pub async fn register_singleton<F, Fut>(&self, name: impl Into<String>, run: F)
    where
        F: Fn(SingletonContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        self.singletons
            .register(name.clone(), singleton_run(run))
            .await;
        self.emit(ShardingRegistrationEvent::SingletonRegistered { name });
        self.sync_singletons().await;
    }

    pub fn messenger<Msg: Message>(self: &Arc<Self>, recipient_type: &RecipientType<Msg>) -> Messenger<Msg> {
        Messenger::new(Arc::clone(self), recipient_type.clone())
    }

    pub fn broadcaster<Msg: Message>(
        self: &Arc<Self>,
        recipient_type: &RecipientType<Msg>,
    ) -> Broadcaster<Msg> {
        Broadcaster::new(Arc::clone(self), recipient_type.clone())
    }

    /// Recipient and singleton registrations from now on.
    pub fn registration_events(
        &self,
    ) -> Pin<Box<dyn Stream<Item = ShardingRegistrationEvent> + Send>> {
        let stream = BroadcastStream::new(self.registration_events.subscribe());
        Box::pin(stream.filter_map(|r: Result<ShardingRegistrationEvent, _>| {
            futures::future::ready(match r {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(count)) => {
                    tracing::warn!(lagged_count = count, "registration event subscriber lagged");
                    None
                }
            })
        }))
    }

    /// Delivers a message to an entity hosted on this pod.
    ///
    /// Without a reply id this returns once the message is queued. With one,
    /// it waits for the reply, or returns `None` if the entity terminated
    /// without replying.
    pub async fn send_to_local_entity(
        &self,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        let recipient = self.recipient(&message.recipient_type)?;
        let Some(reply_id) = message.reply_id else {
            recipient
                .send_binary(message.entity_id, &message.body)
                .await?;
            return Ok(None);
        };

        let (_guard, reply) = self.replies.register(reply_id);
        let scope = recipient
            .send_binary(message.entity_id, &message.body)
            .await?;
        tokio::select! {
            biased;
            reply = reply => Ok(reply.ok()),
            _ = scope.cancelled() => Ok(None),
        }
    }

    /// Delivers a message to an entity hosted on this pod and returns its
    /// streamed reply. The stream ends when the entity finishes it or
    /// terminates.
    pub async fn send_stream_to_local_entity(
        &self,
        message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError> {
        let recipient = self.recipient(&message.recipient_type)?;
        let Some(reply_id) = message.reply_id else {
            return Err(ShardingError::SerializationError {
                reason: "stream request without a reply id".to_string(),
                source: None,
            });
        };

        let (guard, chunks) = self.replies.register_stream(reply_id);
        let scope = recipient
            .send_binary(message.entity_id, &message.body)
            .await?;
        Ok(reply_stream(chunks, guard, scope))
    }

    /// Sends to the owner of the message's shard, retrying while the owner
    /// is unknown, moving, or unreachable.
    pub(crate) async fn route_message(
        &self,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        self.route(message, |pod, message| self.send_to_pod(pod, message))
            .await
    }

    pub(crate) async fn route_stream(
        &self,
        message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError> {
        self.route(message, |pod, message| self.stream_from_pod(pod, message))
            .await
    }

    /// One delivery attempt to a given pod.
    pub(crate) async fn send_to_pod(
        &self,
        pod: PodAddress,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        if pod == self.config.address {
            self.send_to_local_entity(message).await
        } else {
            self.pods.send_message(&pod, message).await
        }
    }

    async fn stream_from_pod(
        &self,
        pod: PodAddress,
        message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError> {
        if pod == self.config.address {
            self.send_stream_to_local_entity(message).await
        } else {
            self.pods.send_stream(&pod, message).await
        }
    }

    async fn route<T, F, Fut>(&self, message: BinaryMessage, deliver: F) -> Result<T, ShardingError>
    where
        F: Fn(PodAddress, BinaryMessage) -> Fut,
        Fut: Future<Output = Result<T, ShardingError>>,
    {
        let shard = self.cache.shard_id(&message.entity_id);
        loop {
            let Some(pod) = self.cache.owner(shard) else {
                tracing::debug!(shard = %shard, entity_id = %message.entity_id, "shard owner unknown, waiting");
                tokio::time::sleep(self.config.unresolved_retry_interval).await;
                continue;
            };
            match deliver(pod.clone(), message.clone()).await {
                Err(err) if err.is_retryable() => {
                    tracing::debug!(
                        pod = %pod,
                        entity_id = %message.entity_id,
                        error = %err,
                        "delivery failed, retrying"
                    );
                    if matches!(err, ShardingError::PodUnavailable { .. }) {
                        self.report_unhealthy(pod);
                    }
                    tokio::time::sleep(self.config.send_retry_interval).await;
                }
                other => return other,
            }
        }
    }

    fn report_unhealthy(&self, pod: PodAddress) {
        let shard_manager = Arc::clone(&self.shard_manager);
        tokio::spawn(async move {
            if let Err(err) = shard_manager.notify_unhealthy_pod(&pod).await {
                tracing::debug!(pod = %pod, error = %err, "could not report unhealthy pod");
            }
        });
    }

    fn recipient(&self, name: &str) -> Result<Arc<dyn LocalRecipient>, ShardingError> {
        self.recipients
            .get(name)
            .map(|recipient| Arc::clone(recipient.value()))
            .ok_or_else(|| ShardingError::EntityTypeNotRegistered {
                name: name.to_string(),
            })
    }

    fn recipients_snapshot(&self) -> Vec<Arc<dyn LocalRecipient>> {
        self.recipients
            .iter()
            .map(|recipient| Arc::clone(recipient.value()))
            .collect()
    }

    fn register_recipient<Msg, F, Fut>(&self, recipient_type: &RecipientType<Msg>, behaviour: F)
    where
        Msg: Message,
        F: Fn(RecipientContext, Mailbox<Msg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let manager = EntityManager::new(
            recipient_type.clone(),
            crate::behaviour::behaviour(behaviour),
            Arc::clone(&self.config),
            Arc::clone(&self.cache),
            Arc::clone(&self.replies),
            Arc::clone(&self.metrics),
        );
        let previous = self
            .recipients
            .insert(recipient_type.name().to_string(), Arc::new(manager));
        if previous.is_some() {
            tracing::warn!(recipient_type = %recipient_type, "recipient type registered twice, replacing it");
        } else {
            tracing::info!(recipient_type = %recipient_type, "registered recipient type");
        }
    }

    async fn terminate_all_entities(&self) {
        let recipients = self.recipients_snapshot();
        join_all(
            recipients
                .iter()
                .map(|recipient| recipient.terminate_all_entities()),
        )
        .await;
    }

    async fn sync_singletons(&self) {
        let desired = self.cache.owns_singleton_shard() && !self.cache.is_shutting_down();
        let running = self.singletons.reconcile(desired).await;
        self.metrics.singletons.set(running as i64);
    }

    fn update_shard_metrics(&self) {
        self.metrics
            .shards
            .set(self.cache.local_shards().len() as i64);
    }

    fn emit(&self, event: ShardingRegistrationEvent) {
        // No subscribers is fine.
        let _ = self.registration_events.send(event);
    }

    fn start_refresh_loop(&self) {
        let mut refresh = self.refresh.lock();
        if refresh.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let token = self.cancel.child_token();
        *refresh = Some(token.clone());
        let this = self.this.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = refresh_assignments(this) => {}
            }
        });
    }
}

/// Follows the assignment feed from storage, seeding the cache from the
/// shard manager first. Re-subscribes after
/// `refresh_assignments_retry_interval` whenever the feed fails or ends.
async fn refresh_assignments(this: Weak<Sharding>) {
    loop {
        let Some(sharding) = this.upgrade() else {
            return;
        };
        let retry = sharding.config.refresh_assignments_retry_interval;

        // Subscribe before the bootstrap read so no save falls in between.
        let feed = sharding.storage.assignments_stream().await;
        match sharding.shard_manager.get_assignments().await {
            Ok(assignments) => {
                if sharding.cache.bootstrap(&assignments) {
                    tracing::debug!(shards = sharding.cache.len(), "shard cache bootstrapped");
                    sharding.update_shard_metrics();
                    sharding.sync_singletons().await;
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not fetch assignments from shard manager");
            }
        }

        match feed {
            Ok(mut feed) => {
                drop(sharding);
                while let Some(assignments) = feed.next().await {
                    let Some(sharding) = this.upgrade() else {
                        return;
                    };
                    sharding.cache.merge_feed(&assignments);
                }
                tracing::warn!("assignment feed ended, resubscribing");
            }
            Err(err) => {
                drop(sharding);
                tracing::warn!(error = %err, "could not subscribe to assignment feed");
            }
        }
        tokio::time::sleep(retry).await;
    }
}

fn reply_stream(
    chunks: mpsc::Receiver<Vec<u8>>,
    guard: PendingReplyGuard,
    scope: CancellationToken,
) -> ByteStream {
    Box::pin(futures::stream::unfold(
        (chunks, guard, scope),
        |(mut chunks, guard, scope)| async move {
            let chunk = tokio::select! {
                biased;
                chunk = chunks.recv() => chunk,
                _ = scope.cancelled() => None,
            };
            chunk.map(|chunk| (Ok(chunk), (chunks, guard, scope)))
        },
    ))
}

impl Drop for Sharding {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard_manager_client::LocalShardManagerClient;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::noop_pods::NoopPods;
    use std::time::Duration;

    fn single_pod() -> Arc<Sharding> {
        let config = ShardingConfig {
            number_of_shards: 10,
            ..ShardingConfig::default()
        };
        let client = LocalShardManagerClient::new(config.address.clone(), config.number_of_shards);
        Sharding::new(
            config,
            Arc::new(NoopPods),
            Arc::new(client),
            Arc::new(MemoryStorage::new()),
            Arc::new(ClusterMetrics::unregistered()),
        )
        .unwrap()
    }

    async fn wait_for_shards(sharding: &Sharding) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sharding.known_shards() < 10 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn register_bootstraps_local_shards() {
        let sharding = single_pod();
        sharding.register().await.unwrap();
        wait_for_shards(&sharding).await;
        assert_eq!(sharding.local_shards().len(), 10);
    }

    #[tokio::test]
    async fn unknown_recipient_type_is_rejected() {
        let sharding = single_pod();
        let err = sharding
            .send_to_local_entity(BinaryMessage {
                entity_id: EntityId::new("e"),
                recipient_type: "Missing".to_string(),
                body: Vec::new(),
                reply_id: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ShardingError::EntityTypeNotRegistered { .. }));
    }

    #[tokio::test]
    async fn recipient_kinds_are_checked() {
        let sharding = single_pod();
        let topic = RecipientType::<u32>::topic("News");
        let err = sharding
            .register_entity(&topic, |_ctx, _mailbox| async {})
            .unwrap_err();
        assert!(matches!(err, ShardingError::InvalidConfig { .. }));
        sharding.register_topic(&topic, |_ctx, _mailbox| async {}).unwrap();
    }

    #[tokio::test]
    async fn registrations_are_announced() {
        let sharding = single_pod();
        let mut events = sharding.registration_events();
        sharding
            .register_entity(&RecipientType::<u32>::entity("Counter"), |_ctx, _mailbox| async {})
            .unwrap();
        sharding.register_singleton("leader", |_ctx| async {}).await;

        assert_eq!(
            events.next().await,
            Some(ShardingRegistrationEvent::EntityRegistered { name: "Counter".into() })
        );
        assert_eq!(
            events.next().await,
            Some(ShardingRegistrationEvent::SingletonRegistered { name: "leader".into() })
        );
    }

    #[tokio::test]
    async fn assignments_are_ignored_while_shutting_down() {
        let sharding = single_pod();
        sharding.cache().set_shutting_down(true);
        sharding.assign(&BTreeSet::from([ShardId(1)])).await;
        assert!(sharding.local_shards().is_empty());
    }
}
