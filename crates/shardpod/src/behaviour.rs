//! Recipient behaviours and the context they run in.
//!
//! A behaviour is started once per entity instance with a [`Mailbox`] and
//! runs until the mailbox yields a poison pill or the entity's scope is
//! cancelled.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::ShardingError;
use crate::message::{encode, Replier, StreamReplier};
use crate::reply::PendingReplies;
use crate::types::EntityId;

/// Entity message loop, started once per entity instance.
pub type RecipientBehaviour<Msg> =
    Arc<dyn Fn(RecipientContext, Mailbox<Msg>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure as a [`RecipientBehaviour`].
pub fn behaviour<Msg, F, Fut>(f: F) -> RecipientBehaviour<Msg>
where
    F: Fn(RecipientContext, Mailbox<Msg>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx, mailbox| f(ctx, mailbox).boxed())
}

/// An item taken from a [`Mailbox`].
#[derive(Debug, PartialEq)]
pub enum Delivery<Msg> {
    Message(Msg),
    /// The entity is being terminated. The behaviour should finish its
    /// current work and return.
    PoisonPill,
}

/// Single-consumer queue of messages for one entity instance.
pub struct Mailbox<Msg> {
    rx: mpsc::UnboundedReceiver<Delivery<Msg>>,
}

impl<Msg> Mailbox<Msg> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Delivery<Msg>>) -> Self {
        Self { rx }
    }

    /// Next delivery, including poison pills. `None` once the queue is closed.
    pub async fn next(&mut self) -> Option<Delivery<Msg>> {
        self.rx.recv().await
    }

    /// Next message. Returns `None` on a poison pill or a closed queue.
    pub async fn recv(&mut self) -> Option<Msg> {
        match self.rx.recv().await {
            Some(Delivery::Message(msg)) => Some(msg),
            Some(Delivery::PoisonPill) | None => None,
        }
    }
}

/// Handle given to a behaviour for one entity instance.
#[derive(Clone)]
pub struct RecipientContext {
    entity_id: EntityId,
    recipient_type: String,
    scope: CancellationToken,
    replies: Arc<PendingReplies>,
}

impl RecipientContext {
    pub(crate) fn new(
        entity_id: EntityId,
        recipient_type: String,
        scope: CancellationToken,
        replies: Arc<PendingReplies>,
    ) -> Self {
        Self {
            entity_id,
            recipient_type,
            scope,
            replies,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn recipient_type(&self) -> &str {
        &self.recipient_type
    }

    /// Token cancelled when the entity's scope closes.
    pub fn cancellation(&self) -> CancellationToken {
        self.scope.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Sends the reply for `replier`. Replying to a sender that already gave
    /// up is not an error.
    pub fn reply<R: Serialize>(&self, replier: &Replier<R>, value: &R) -> Result<(), ShardingError> {
        let bytes = encode(value)?;
        self.replies.complete(replier.id(), bytes);
        Ok(())
    }

    /// Streams `values` back to the sender of `replier`.
    ///
    /// The stream is forwarded by a task inside the entity's scope. It stops
    /// when the stream ends, the receiver goes away, or the scope closes.
    pub fn reply_stream<R, S>(&self, replier: &StreamReplier<R>, values: S)
    where
        R: Serialize + Send + 'static,
        S: Stream<Item = R> + Send + 'static,
    {
        let Some(tx) = self.replies.take_stream(replier.id()) else {
            tracing::debug!(reply_id = %replier.id(), "no pending stream for reply");
            return;
        };
        let scope = self.scope.clone();
        let reply_id = replier.id().clone();
        tokio::spawn(async move {
            let mut values = std::pin::pin!(values);
            loop {
                tokio::select! {
                    _ = scope.cancelled() => break,
                    _ = tx.closed() => break,
                    item = values.next() => {
                        let Some(item) = item else { break };
                        let bytes = match encode(&item) {
                            Ok(bytes) => bytes,
                            Err(err) => {
                                tracing::warn!(reply_id = %reply_id, error = %err, "dropping stream reply");
                                break;
                            }
                        };
                        if tx.send(bytes).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Spawns a task bound to the entity's scope. The task is dropped when
    /// the scope closes.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let scope = self.scope.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = scope.cancelled() => {}
                _ = task => {}
            }
        })
    }
}
