use async_trait::async_trait;

use crate::error::ShardingError;
use crate::types::PodAddress;

/// Liveness probe used by the shard manager before declaring a pod dead.
#[async_trait]
pub trait PodsHealth: Send + Sync {
    async fn is_alive(&self, pod: &PodAddress) -> Result<bool, ShardingError>;
}
