//! Entity sharding runtime.
//!
//! Entities are addressed by type and id and hashed onto a fixed number of
//! shards. A [`ShardManager`](shard_manager::ShardManager) assigns shards to
//! registered pods and rebalances them as pods come and go. Each pod runs a
//! [`Sharding`](sharding::Sharding) instance that hosts the entities of the
//! shards it owns and routes messages for everything else to the owning pod.
//!
//! ```ignore
//! use shardpod::prelude::*;
//!
//! #[derive(Serialize, Deserialize)]
//! enum CounterMsg {
//!     Increment,
//!     Get(Replier<u64>),
//! }
//!
//! let counter = RecipientType::<CounterMsg>::entity("Counter");
//! sharding.register_entity(&counter, |ctx, mut mailbox| async move {
//!     let mut count = 0;
//!     while let Some(msg) = mailbox.recv().await {
//!         match msg {
//!             CounterMsg::Increment => count += 1,
//!             CounterMsg::Get(replier) => {
//!                 let _ = ctx.reply(&replier, &count);
//!             }
//!         }
//!     }
//! })?;
//!
//! let messenger = sharding.messenger(&counter);
//! messenger.send_discard("c-1", CounterMsg::Increment).await?;
//! let count: u64 = messenger.send("c-1", CounterMsg::Get).await?;
//! ```

pub mod behaviour;
pub mod cluster_storage;
pub mod config;
pub mod entity_manager;
pub mod error;
pub mod events;
pub mod hash;
pub mod manager_state;
pub mod message;
pub mod messenger;
pub mod metrics;
pub mod pod;
pub mod pods;
pub mod pods_health;
pub mod recipient;
pub mod reply;
pub mod shard_assigner;
pub mod shard_cache;
pub mod shard_manager;
pub mod shard_manager_client;
pub mod sharding;
pub mod singleton;
pub mod storage;
pub mod testing;
pub mod types;

/// Commonly used items.
pub mod prelude {
    pub use crate::behaviour::{Delivery, Mailbox, RecipientContext};
    pub use crate::config::{ManagerConfig, ShardingConfig};
    pub use crate::error::ShardingError;
    pub use crate::message::{Replier, StreamReplier};
    pub use crate::messenger::{Broadcaster, Messenger};
    pub use crate::recipient::RecipientType;
    pub use crate::sharding::Sharding;
    pub use crate::singleton::SingletonContext;
    pub use crate::types::{EntityId, PodAddress, ShardId};
    pub use serde::{Deserialize, Serialize};
}
