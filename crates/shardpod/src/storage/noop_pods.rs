use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::error::ShardingError;
use crate::message::{BinaryMessage, ByteStream};
use crate::pods::Pods;
use crate::types::{PodAddress, ShardId};

/// Pod transport for a single-pod deployment. Shard moves are acknowledged
/// without doing anything; messages cannot reach another pod.
pub struct NoopPods;

#[async_trait]
impl Pods for NoopPods {
    async fn ping(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn assign_shards(
        &self,
        _pod: &PodAddress,
        _shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn unassign_shards(
        &self,
        _pod: &PodAddress,
        _shards: &BTreeSet<ShardId>,
    ) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn send_message(
        &self,
        pod: &PodAddress,
        _message: BinaryMessage,
    ) -> Result<Option<Vec<u8>>, ShardingError> {
        Err(ShardingError::unavailable(pod))
    }

    async fn send_stream(
        &self,
        pod: &PodAddress,
        _message: BinaryMessage,
    ) -> Result<ByteStream, ShardingError> {
        Err(ShardingError::unavailable(pod))
    }
}
