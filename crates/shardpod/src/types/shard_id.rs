use serde::{Deserialize, Serialize};
use std::fmt;

/// One partition of the entity keyspace. Valid ids are `1..=number_of_shards`.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardId(pub u32);

impl ShardId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// All shard ids of a cluster with `number_of_shards` shards.
    pub fn all(number_of_shards: u32) -> impl Iterator<Item = ShardId> {
        (1..=number_of_shards).map(ShardId)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
