mod entity_id;
mod pod_address;
mod reply_id;
mod shard_id;

pub use entity_id::EntityId;
pub use pod_address::PodAddress;
pub use reply_id::{ReplyId, ReplyIdGenerator};
pub use shard_id::ShardId;
