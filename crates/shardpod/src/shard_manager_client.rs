use async_trait::async_trait;

use crate::cluster_storage::Assignments;
use crate::error::ShardingError;
use crate::pod::Pod;
use crate::types::{PodAddress, ShardId};

/// A pod's view of the shard manager.
#[async_trait]
pub trait ShardManagerClient: Send + Sync {
    async fn register(&self, pod: Pod) -> Result<(), ShardingError>;

    async fn unregister(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    /// Report a pod that failed to answer. The shard manager decides whether
    /// it is actually gone.
    async fn notify_unhealthy_pod(&self, pod: &PodAddress) -> Result<(), ShardingError>;

    async fn get_assignments(&self) -> Result<Assignments, ShardingError>;
}

/// Shard manager stand-in for a single-pod deployment: every shard belongs
/// to the local pod and registration is a no-op.
pub struct LocalShardManagerClient {
    assignments: Assignments,
}

impl LocalShardManagerClient {
    pub fn new(address: PodAddress, number_of_shards: u32) -> Self {
        Self {
            assignments: ShardId::all(number_of_shards)
                .map(|shard| (shard, Some(address.clone())))
                .collect(),
        }
    }
}

#[async_trait]
impl ShardManagerClient for LocalShardManagerClient {
    async fn register(&self, _pod: Pod) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn unregister(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn notify_unhealthy_pod(&self, _pod: &PodAddress) -> Result<(), ShardingError> {
        Ok(())
    }

    async fn get_assignments(&self) -> Result<Assignments, ShardingError> {
        Ok(self.assignments.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_client_owns_every_shard() {
        let address = PodAddress::new("localhost", 54321);
        let client = LocalShardManagerClient::new(address.clone(), 10);
        let assignments = client.get_assignments().await.unwrap();
        assert_eq!(assignments.len(), 10);
        assert!(assignments.values().all(|owner| owner.as_ref() == Some(&address)));
        client.register(Pod::new(address.clone(), "1.0.0")).await.unwrap();
        client.unregister(&address).await.unwrap();
    }
}
