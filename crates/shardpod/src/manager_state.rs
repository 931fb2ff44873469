//! The shard manager's view of the cluster.
//!
//! A [`ShardManagerState`] is an immutable snapshot. Every mutation builds a
//! new snapshot with its derived statistics recomputed, which the shard
//! manager then swaps in atomically.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::pod::{compare_versions, PodWithMetadata};
use crate::types::{PodAddress, ShardId};

#[derive(Debug, Clone, PartialEq)]
pub struct ShardManagerState {
    pods: HashMap<PodAddress, PodWithMetadata>,
    shards: BTreeMap<ShardId, Option<PodAddress>>,
    unassigned_shards: BTreeSet<ShardId>,
    shards_per_pod: HashMap<PodAddress, BTreeSet<ShardId>>,
    average_shards_per_pod: usize,
    max_version: Option<String>,
    all_pods_have_max_version: bool,
}

impl ShardManagerState {
    /// Builds a snapshot. Shard owners that are not registered pods are
    /// treated as unassigned.
    pub fn new(
        pods: HashMap<PodAddress, PodWithMetadata>,
        mut shards: BTreeMap<ShardId, Option<PodAddress>>,
    ) -> Self {
        for owner in shards.values_mut() {
            if owner.as_ref().is_some_and(|pod| !pods.contains_key(pod)) {
                *owner = None;
            }
        }

        let unassigned_shards = shards
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(shard, _)| *shard)
            .collect();

        let mut shards_per_pod: HashMap<PodAddress, BTreeSet<ShardId>> = pods
            .keys()
            .map(|address| (address.clone(), BTreeSet::new()))
            .collect();
        for (shard, owner) in &shards {
            if let Some(owner) = owner {
                shards_per_pod
                    .entry(owner.clone())
                    .or_default()
                    .insert(*shard);
            }
        }

        let average_shards_per_pod = if pods.is_empty() {
            0
        } else {
            shards.len() / pods.len()
        };

        let max_version = pods
            .values()
            .map(|pod| pod.version())
            .max_by(|a, b| compare_versions(a, b))
            .map(str::to_string);
        let all_pods_have_max_version = match &max_version {
            Some(max) => pods
                .values()
                .all(|pod| compare_versions(pod.version(), max) == Ordering::Equal),
            None => true,
        };

        Self {
            pods,
            shards,
            unassigned_shards,
            shards_per_pod,
            average_shards_per_pod,
            max_version,
            all_pods_have_max_version,
        }
    }

    /// Empty cluster with shards `1..=number_of_shards`, all unassigned.
    pub fn empty(number_of_shards: u32) -> Self {
        Self::new(
            HashMap::new(),
            ShardId::all(number_of_shards).map(|s| (s, None)).collect(),
        )
    }

    pub fn pods(&self) -> &HashMap<PodAddress, PodWithMetadata> {
        &self.pods
    }

    pub fn shards(&self) -> &BTreeMap<ShardId, Option<PodAddress>> {
        &self.shards
    }

    pub fn owner(&self, shard: ShardId) -> Option<&PodAddress> {
        self.shards.get(&shard).and_then(Option::as_ref)
    }

    pub fn unassigned_shards(&self) -> &BTreeSet<ShardId> {
        &self.unassigned_shards
    }

    /// Shards held by every registered pod, including pods that hold none.
    pub fn shards_per_pod(&self) -> &HashMap<PodAddress, BTreeSet<ShardId>> {
        &self.shards_per_pod
    }

    pub fn average_shards_per_pod(&self) -> usize {
        self.average_shards_per_pod
    }

    pub fn max_version(&self) -> Option<&str> {
        self.max_version.as_deref()
    }

    pub fn all_pods_have_max_version(&self) -> bool {
        self.all_pods_have_max_version
    }

    /// Registered pods reporting the highest version, in address order.
    pub fn pods_at_max_version(&self) -> Vec<&PodAddress> {
        let Some(max) = self.max_version.as_deref() else {
            return Vec::new();
        };
        let mut pods: Vec<&PodAddress> = self
            .pods
            .values()
            .filter(|pod| compare_versions(pod.version(), max) == Ordering::Equal)
            .map(PodWithMetadata::address)
            .collect();
        pods.sort();
        pods
    }

    pub fn with_pod(&self, pod: PodWithMetadata) -> Self {
        let mut pods = self.pods.clone();
        pods.insert(pod.address().clone(), pod);
        Self::new(pods, self.shards.clone())
    }

    /// Removes a pod, returning the new state and the shards it owned.
    pub fn without_pod(&self, address: &PodAddress) -> (Self, BTreeSet<ShardId>) {
        let released = self
            .shards_per_pod
            .get(address)
            .cloned()
            .unwrap_or_default();
        let mut pods = self.pods.clone();
        pods.remove(address);
        let mut shards = self.shards.clone();
        for shard in &released {
            shards.insert(*shard, None);
        }
        (Self::new(pods, shards), released)
    }

    pub fn with_shards<'a>(
        &self,
        shards: impl IntoIterator<Item = &'a ShardId>,
        owner: Option<&PodAddress>,
    ) -> Self {
        let mut table = self.shards.clone();
        for shard in shards {
            table.insert(*shard, owner.cloned());
        }
        Self::new(self.pods.clone(), table)
    }
}
