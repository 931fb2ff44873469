use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::ShardingError;
use crate::message::{BinaryMessage, ByteStream};
use crate::types::{PodAddress, ShardId};

/// Transport to other pods, used by the shard manager to move shards and by
/// pods to deliver messages to entities hosted elsewhere.
#[async_trait]
pub trait Pods: Send + Sync {
    /// Check that a pod responds.
    async fn ping(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    /// Tell a pod it now owns `shards`.
    async fn assign_shards(
        &self,
        pod: &PodAddress,
        shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError>;

    /// Tell a pod it no longer owns `shards`. Returns once the pod has
    /// terminated the entities on those shards.
    async fn unassign_shards(
        &self,
        pod: &PodAddress,
        shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError>;

    /// Deliver a message. Returns the encoded reply if the message carried a
    /// reply id and the entity answered.
    async fn send_message(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError>;

    /// Deliver a message whose reply is a stream of chunks.
    async fn send_stream(
        &self,
        pod: &PodAddress,
        message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError>;
}
