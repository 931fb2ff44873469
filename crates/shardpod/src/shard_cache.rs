//! The pod's cached view of the shard table.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;

use crate::cluster_storage::Assignments;
use crate::hash::shard_for_entity;
use crate::types::{EntityId, PodAddress, ShardId};

/// Shard hosting all singletons.
pub const SINGLETON_SHARD: ShardId = ShardId(1);

/// Shard → pod table as known by one pod.
///
/// Entries for shards this pod owns come only from direct `assign` and
/// `unassign` calls from the shard manager. The storage feed fills in every
/// other pod's shards but never overrides this pod's own entries, since the
/// feed lags behind the shard manager's direct calls.
pub struct ShardCache {
    address: PodAddress,
    number_of_shards: u32,
    table: RwLock<HashMap<ShardId, PodAddress>>,
    shutting_down: AtomicBool,
}

impl ShardCache {
    pub fn new(address: PodAddress, number_of_shards: u32) -> Self {
        Self {
            address,
            number_of_shards,
            table: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn address(&self) -> &PodAddress {
        &self.address
    }

    pub fn shard_id(&self, entity_id: &EntityId) -> ShardId {
        shard_for_entity(entity_id, self.number_of_shards)
    }

    pub fn owner(&self, shard: ShardId) -> Option<PodAddress> {
        self.table.read().get(&shard).cloned()
    }

    pub fn is_local(&self, shard: ShardId) -> bool {
        self.table.read().get(&shard) == Some(&self.address)
    }

    pub fn is_entity_on_local_shards(&self, entity_id: &EntityId) -> bool {
        self.is_local(self.shard_id(entity_id))
    }

    pub fn owns_singleton_shard(&self) -> bool {
        self.is_local(SINGLETON_SHARD)
    }

    pub fn local_shards(&self) -> BTreeSet<ShardId> {
        self.table
            .read()
            .iter()
            .filter(|(_, owner)| **owner == self.address)
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Distinct pods owning at least one shard.
    pub fn pods(&self) -> BTreeSet<PodAddress> {
        self.table.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn assign(&self, shards: &BTreeSet<ShardId>) {
        let mut table = self.table.write();
        for shard in shards {
            table.insert(*shard, self.address.clone());
        }
    }

    /// Drops the given shards, but only those this pod still owns.
    pub fn unassign(&self, shards: &BTreeSet<ShardId>) {
        let mut table = self.table.write();
        for shard in shards {
            if table.get(shard) == Some(&self.address) {
                table.remove(shard);
            }
        }
    }

    /// Seeds the table from the shard manager. Ignored once the table has
    /// entries. Returns whether the table was replaced.
    pub fn bootstrap(&self, assignments: &Assignments) -> bool {
        let mut table = self.table.write();
        if !table.is_empty() {
            return false;
        }
        *table = owned_entries(assignments).collect();
        true
    }

    /// Applies a table published by storage: other pods' entries come from
    /// the feed, this pod's own entries are kept as they are.
    pub fn merge_feed(&self, assignments: &Assignments) {
        let mut table = self.table.write();
        let mut merged: HashMap<ShardId, PodAddress> = owned_entries(assignments)
            .filter(|(_, owner)| *owner != self.address)
            .collect();
        merged.extend(
            table
                .iter()
                .filter(|(_, owner)| **owner == self.address)
                .map(|(shard, owner)| (*shard, owner.clone())),
        );
        *table = merged;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn set_shutting_down(&self, shutting_down: bool) {
        self.shutting_down.store(shutting_down, Ordering::Release);
    }
}

fn owned_entries(assignments: &Assignments) -> impl Iterator<Item = (ShardId, PodAddress)> + '_ {
    assignments
        .iter()
        .filter_map(|(shard, owner)| owner.as_ref().map(|owner| (*shard, owner.clone())))
}
