use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::ShardingError;
use crate::message::{BinaryMessage, ByteStream};
use crate::pods::Pods;
use crate::pods_health::PodsHealth;
use crate::sharding::Sharding;
use crate::types::{PodAddress, ShardId};

struct LocalPod {
    sharding: Weak<Sharding>,
    /// Cancelled on disconnect; fails in-flight calls and open streams.
    connection: CancellationToken,
}

/// In-process pod transport: calls go straight to the [`Sharding`] instances
/// registered here.
///
/// A pod can be disconnected to simulate a crash or a network partition. It
/// then fails every call with `PodUnavailable` and reports itself dead to
/// health probes.
#[derive(Default)]
pub struct LocalPods {
    pods: DashMap<PodAddress, LocalPod>,
}

impl LocalPods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sharding: &Arc<Sharding>) {
        self.pods.insert(
            sharding.address().clone(),
            LocalPod {
                sharding: Arc::downgrade(sharding),
                connection: CancellationToken::new(),
            },
        );
    }

    pub fn disconnect(&self, pod: &PodAddress) {
        if let Some((_, local)) = self.pods.remove(pod) {
            local.connection.cancel();
            tracing::info!(pod = %pod, "disconnected local pod");
        }
    }

    pub fn is_connected(&self, pod: &PodAddress) -> bool {
        self.pods
            .get(pod)
            .is_some_and(|local| local.sharding.strong_count() > 0)
    }

    fn connect(&self, pod: &PodAddress) -> Result<(Arc<Sharding>, CancellationToken), ShardingError> {
        let local = self
            .pods
            .get(pod)
            .ok_or_else(|| ShardingError::unavailable(pod))?;
        let sharding = local
            .sharding
            .upgrade()
            .ok_or_else(|| ShardingError::unavailable(pod))?;
        Ok((sharding, local.connection.clone()))
    }
}

#[async_trait]
impl Pods for LocalPods {
    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError> {
        self.connect(pod).map(|_| ())
    }

    async fn assign_shards(
        &self,
        pod: &PodAddress,
        shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError> {
        let (sharding, connection) = self.connect(pod)?;
        tokio::select! {
            _ = connection.cancelled() => Err(ShardingError::unavailable(pod)),
            _ = sharding.assign(shards) => Ok(()),
        }
    }

    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError> {
        let (sharding, connection) = self.connect(pod)?;
        tokio::select! {
            _ = connection.cancelled() => Err(ShardingError::unavailable(pod)),
            _ = sharding.unassign(shards) => Ok(()),
        }
    }

    async fn send_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        let (sharding, connection) = self.connect(pod)?;
        tokio::select! {
            _ = connection.cancelled() => Err(ShardingError::unavailable(pod)),
            reply = sharding.send_to_local_entity(message) => reply,
        }
    }

    async fn send_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError> {
        let (sharding, connection) = self.connect(pod)?;
        let chunks = tokio::select! {
            _ = connection.cancelled() => return Err(ShardingError::unavailable(pod)),
            chunks = sharding.send_stream_to_local_entity(message) => chunks?,
        };
        // A disconnect mid-stream surfaces as a final PodUnavailable item.
        let pod = pod.clone();
        Ok(Box::pin(futures::stream::unfold(
            Some((chunks, connection, pod)),
            |state| async move {
                let (mut chunks, connection, pod) = state?;
                tokio::select! {
                    biased;
                    _ = connection.cancelled() => {
                        Some((Err(ShardingError::unavailable(&pod)), None))
                    }
                    chunk = chunks.next() => {
                        chunk.map(|chunk| (chunk, Some((chunks, connection, pod))))
                    }
                }
            },
        )))
    }
}

#[async_trait]
impl PodsHealth for LocalPods {
    async fn is_alive(&self, pod: &PodAddress) -> Result<bool, ShardingError> {
        Ok(self.is_connected(pod))
    }
}
