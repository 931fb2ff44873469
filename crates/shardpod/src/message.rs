use std::fmt;
use std::marker::PhantomData;
use std::pin::Pin;

use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ShardingError;
use crate::types::{EntityId, ReplyId};

/// Marker for types that can be sent to a recipient. Messages cross pod
/// boundaries encoded with MessagePack.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {}

impl<T> Message for T where T: Serialize + DeserializeOwned + Send + 'static {}

/// Stream of encoded reply chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ShardingError>> + Send>>;

/// An encoded message addressed to one entity (or topic) on some pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryMessage {
    pub entity_id: EntityId,
    pub recipient_type: String,
    pub body: Vec<u8>,
    pub reply_id: Option<ReplyId>,
}

/// Capability embedded in a request to send one reply of type `R` back to
/// the sender. Reply through [`RecipientContext::reply`](crate::behaviour::RecipientContext::reply).
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Replier<R> {
    id: ReplyId,
    #[serde(skip)]
    _reply: PhantomData<fn() -> R>,
}

impl<R> Replier<R> {
    pub(crate) fn new(id: ReplyId) -> Self {
        Self {
            id,
            _reply: PhantomData,
        }
    }

    pub fn id(&self) -> &ReplyId {
        &self.id
    }
}

impl<R> Clone for Replier<R> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<R> fmt::Debug for Replier<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Replier").field(&self.id).finish()
    }
}

impl<R> PartialEq for Replier<R> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

/// Like [`Replier`], for a stream of `R` values bound to one reply id.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct StreamReplier<R> {
    id: ReplyId,
    #[serde(skip)]
    _reply: PhantomData<fn() -> R>,
}

impl<R> StreamReplier<R> {
    pub(crate) fn new(id: ReplyId) -> Self {
        Self {
            id,
            _reply: PhantomData,
        }
    }

    pub fn id(&self) -> &ReplyId {
        &self.id
    }
}

impl<R> Clone for StreamReplier<R> {
    fn clone(&self) -> Self {
        Self::new(self.id.clone())
    }
}

impl<R> fmt::Debug for StreamReplier<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StreamReplier").field(&self.id).finish()
    }
}

impl<R> PartialEq for StreamReplier<R> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, ShardingError> {
    rmp_serde::to_vec(value).map_err(ShardingError::encode)
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ShardingError> {
    rmp_serde::from_slice(bytes).map_err(ShardingError::decode)
}
