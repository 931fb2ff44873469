use std::collections::BTreeSet;
use std::fmt;

use crate::types::{PodAddress, ShardId};

/// Cluster lifecycle events published by the shard manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingEvent {
    ShardsAssigned {
        pod: PodAddress,
        shards: BTreeSet<ShardId>,
    },
    ShardsUnassigned {
        pod: PodAddress,
        shards: BTreeSet<ShardId>,
    },
    PodRegistered {
        pod: PodAddress,
    },
    PodUnregistered {
        pod: PodAddress,
    },
    PodHealthChecked {
        pod: PodAddress,
    },
}

impl fmt::Display for ShardingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardingEvent::ShardsAssigned { pod, shards } => {
                write!(f, "ShardsAssigned(pod={pod}, shards={})", shards.len())
            }
            ShardingEvent::ShardsUnassigned { pod, shards } => {
                write!(f, "ShardsUnassigned(pod={pod}, shards={})", shards.len())
            }
            ShardingEvent::PodRegistered { pod } => write!(f, "PodRegistered(pod={pod})"),
            ShardingEvent::PodUnregistered { pod } => write!(f, "PodUnregistered(pod={pod})"),
            ShardingEvent::PodHealthChecked { pod } => write!(f, "PodHealthChecked(pod={pod})"),
        }
    }
}

/// Events emitted by a pod when recipients or singletons are registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardingRegistrationEvent {
    EntityRegistered { name: String },
    TopicRegistered { name: String },
    SingletonRegistered { name: String },
}
