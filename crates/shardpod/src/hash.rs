use crate::types::{EntityId, ShardId};

/// DJB2 hash. Deterministic across processes and platforms, so every pod
/// maps an entity id to the same shard.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Shard owning `entity_id` in a cluster of `number_of_shards` shards.
///
/// Returns a 1-indexed shard in `1..=number_of_shards`.
///
/// # Panics
///
/// Panics if `number_of_shards` is 0. Configs are validated before any
/// routing happens, so this only fires on programmer error.
pub fn shard_for_entity(entity_id: &EntityId, number_of_shards: u32) -> ShardId {
    assert!(
        number_of_shards >= 1,
        "number_of_shards must be >= 1, got {number_of_shards}"
    );
    ShardId(djb2_hash(entity_id.as_ref().as_bytes()) % number_of_shards + 1)
}
