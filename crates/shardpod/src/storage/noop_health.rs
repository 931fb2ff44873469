use async_trait::async_trait;

use crate::error::ShardingError;
use crate::pods_health::PodsHealth;
use crate::types::PodAddress;

/// Health probe that always reports alive.
pub struct NoopPodsHealth;

#[async_trait]
impl PodsHealth for NoopPodsHealth {
    async fn is_alive(&self, _pod: &PodAddress) -> Result<bool, ShardingError> {
        Ok(true)
    }
}
