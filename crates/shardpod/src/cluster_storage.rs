use std::collections::BTreeMap;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::ShardingError;
use crate::pod::Pod;
use crate::types::{PodAddress, ShardId};

/// Shard table as persisted: every shard with its owner, if any.
pub type Assignments = BTreeMap<ShardId, Option<PodAddress>>;

/// External persistence of the pod and shard tables.
///
/// The shard manager's in-memory state is authoritative; storage is written
/// best-effort and read on start-up. Pods follow the assignment feed to learn
/// where shards they do not own live.
#[async_trait]
pub trait ClusterStorage: Send + Sync {
    async fn get_pods(&self) -> Result<Vec<Pod>, ShardingError>;

    async fn save_pods(&self, pods: Vec<Pod>) -> Result<(), ShardingError>;

    async fn get_assignments(&self) -> Result<Assignments, ShardingError>;

    async fn save_assignments(&self, assignments: Assignments) -> Result<(), ShardingError>;

    /// Feed of assignment tables, one item per save. The stream may end or
    /// fail; callers re-subscribe.
    async fn assignments_stream(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = Assignments> + Send>>, ShardingError>;
}
