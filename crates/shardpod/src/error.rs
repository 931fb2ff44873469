use std::time::Duration;

use crate::types::{EntityId, PodAddress};

/// Errors that can occur in the sharding runtime.
#[derive(Debug, thiserror::Error)]
pub enum ShardingError {
    #[error("entity {entity_id} is not managed by this pod")]
    EntityNotManagedByThisPod { entity_id: EntityId },

    #[error("pod unavailable: {address}")]
    PodUnavailable {
        address: PodAddress,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("pod no longer registered: {address}")]
    PodNoLongerRegistered { address: PodAddress },

    #[error("entity type not registered: {name}")]
    EntityTypeNotRegistered { name: String },

    #[error("entity {entity_id} did not reply to a message expecting a reply")]
    MessageReturnedNothing { entity_id: EntityId },

    #[error("entity {entity_id} stopped reading its mailbox")]
    EntityMailboxClosed { entity_id: EntityId },

    #[error("send to {entity_id} timed out after {timeout:?}")]
    SendTimeout {
        entity_id: EntityId,
        timeout: Duration,
    },

    #[error("serialization error: {reason}")]
    SerializationError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("storage persist error: {reason}")]
    StoragePersistError {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("sharding is shutting down")]
    ShuttingDown,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl ShardingError {
    /// Routing races and transient transport failures. The messenger retries
    /// these internally; everything else is surfaced to the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardingError::EntityNotManagedByThisPod { .. } | ShardingError::PodUnavailable { .. }
        )
    }

    pub(crate) fn unavailable(address: &PodAddress) -> Self {
        ShardingError::PodUnavailable {
            address: address.clone(),
            source: None,
        }
    }

    pub(crate) fn encode(err: rmp_serde::encode::Error) -> Self {
        ShardingError::SerializationError {
            reason: format!("failed to encode message: {err}"),
            source: Some(Box::new(err)),
        }
    }

    pub(crate) fn decode(err: rmp_serde::decode::Error) -> Self {
        ShardingError::SerializationError {
            reason: format!("failed to decode message: {err}"),
            source: Some(Box::new(err)),
        }
    }
}
