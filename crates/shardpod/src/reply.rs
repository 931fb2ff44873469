//! Request/reply correlation.
//!
//! The pod hosting an entity registers a slot per [`ReplyId`] before handing
//! the message to the entity; the entity's reply completes the slot. Slots
//! are owned by a [`PendingReplyGuard`] that removes them when the waiting
//! side goes away, so cancelled sends never leak waiters.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

use crate::types::ReplyId;

/// Buffered chunks per streamed reply before the producer waits for the consumer.
pub const STREAM_REPLY_BUFFER: usize = 16;

enum ReplySlot {
    Single(oneshot::Sender<Vec<u8>>),
    Stream(mpsc::Sender<Vec<u8>>),
}

#[derive(Default)]
pub struct PendingReplies {
    slots: DashMap<ReplyId, ReplySlot>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for a single reply.
    pub fn register(
        self: &Arc<Self>,
        id: ReplyId,
    ) -> (PendingReplyGuard, oneshot::Receiver<Vec<u8>>) {
        let (tx, rx) = oneshot::channel();
        self.insert(id.clone(), ReplySlot::Single(tx));
        (self.guard(id), rx)
    }

    /// Registers a slot for a streamed reply.
    pub fn register_stream(
        self: &Arc<Self>,
        id: ReplyId,
    ) -> (PendingReplyGuard, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(STREAM_REPLY_BUFFER);
        self.insert(id.clone(), ReplySlot::Stream(tx));
        (self.guard(id), rx)
    }

    /// Completes a single-reply slot. Returns `false` if nobody waits for it.
    pub fn complete(&self, id: &ReplyId, reply: Vec<u8>) -> bool {
        match self.slots.remove(id) {
            Some((_, ReplySlot::Single(tx))) => tx.send(reply).is_ok(),
            Some((id, slot @ ReplySlot::Stream(_))) => {
                tracing::warn!(reply_id = %id, "single reply sent to a streamed reply slot");
                self.slots.insert(id, slot);
                false
            }
            None => {
                tracing::debug!(reply_id = %id, "reply has no pending waiter");
                false
            }
        }
    }

    /// Takes the sender of a streamed reply slot.
    pub fn take_stream(&self, id: &ReplyId) -> Option<mpsc::Sender<Vec<u8>>> {
        match self.slots.remove(id) {
            Some((_, ReplySlot::Stream(tx))) => Some(tx),
            Some((id, slot)) => {
                tracing::warn!(reply_id = %id, "streamed reply sent to a single reply slot");
                self.slots.insert(id, slot);
                None
            }
            None => None,
        }
    }

    /// Drops a slot. The waiting side observes a closed channel.
    pub fn abort(&self, id: &ReplyId) {
        self.slots.remove(id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn insert(&self, id: ReplyId, slot: ReplySlot) {
        if self.slots.insert(id.clone(), slot).is_some() {
            tracing::warn!(reply_id = %id, "reply id reused while a reply was pending");
        }
    }

    fn guard(self: &Arc<Self>, id: ReplyId) -> PendingReplyGuard {
        PendingReplyGuard {
            replies: Arc::clone(self),
            id,
        }
    }
}

/// Removes its reply slot on drop.
pub struct PendingReplyGuard {
    replies: Arc<PendingReplies>,
    id: ReplyId,
}

impl PendingReplyGuard {
    pub fn id(&self) -> &ReplyId {
        &self.id
    }
}

impl Drop for PendingReplyGuard {
    fn drop(&mut self) {
        self.replies.abort(&self.id);
    }
}
