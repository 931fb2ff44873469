//! Typed clients for sending to entities and broadcasting to topics.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;

use crate::error::ShardingError;
use crate::message::{decode, encode, BinaryMessage, Message, Replier, StreamReplier};
use crate::recipient::RecipientType;
use crate::sharding::Sharding;
use crate::types::{EntityId, PodAddress};

/// Sends messages of type `Msg` to entities of one recipient type, wherever
/// in the cluster they live.
///
/// Routing races and unreachable pods are retried until the send timeout
/// (`ShardingConfig::send_timeout` unless overridden) runs out.
pub struct Messenger<Msg> {
    sharding: Arc<Sharding>,
    recipient_type: RecipientType<Msg>,
    timeout: Option<Duration>,
}

impl<Msg> Clone for Messenger<Msg> {
    fn clone(&self) -> Self {
        Self {
            sharding: Arc::clone(&self.sharding),
            recipient_type: self.recipient_type.clone(),
            timeout: self.timeout,
        }
    }
}

impl<Msg: Message> Messenger<Msg> {
    pub(crate) fn new(sharding: Arc<Sharding>, recipient_type: RecipientType<Msg>) -> Self {
        Self {
            sharding,
            recipient_type,
            timeout: None,
        }
    }

    /// Overrides the send timeout for this messenger.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn recipient_type(&self) -> &RecipientType<Msg> {
        &self.recipient_type
    }

    fn send_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(self.sharding.config().send_timeout)
    }

    /// Delivers `msg` without waiting for a reply. Returns once the owning
    /// pod accepted it.
    pub async fn send_discard(
        &self,
        entity_id: impl Into<EntityId>,
        msg: Msg,
    ) -> Result<(), ShardingError> {
        let entity_id = entity_id.into();
        let message = self.binary(&entity_id, &msg)?;
        self.timed(&entity_id, self.sharding.route_message(message))
            .await
            .map(|_| ())
    }

    /// Sends the message built by `make` and waits for the entity's reply.
    ///
    /// Fails with `MessageReturnedNothing` if the entity terminated without
    /// replying, and with `SendTimeout` when no reply arrived in time.
    pub async fn send<R, F>(&self, entity_id: impl Into<EntityId>, make: F) -> Result<R, ShardingError>
    where
        R: DeserializeOwned,
        F: FnOnce(Replier<R>) -> Msg,
    {
        let entity_id = entity_id.into();
        let reply_id = self.sharding.next_reply_id();
        let msg = make(Replier::new(reply_id.clone()));
        let mut message = self.binary(&entity_id, &msg)?;
        message.reply_id = Some(reply_id);

        match self
            .timed(&entity_id, self.sharding.route_message(message))
            .await?
        {
            Some(bytes) => decode(&bytes),
            None => Err(ShardingError::MessageReturnedNothing { entity_id }),
        }
    }

    /// Sends the message built by `make` and returns the entity's streamed
    /// reply. The timeout covers opening the stream, not consuming it.
    /// Dropping the stream stops the entity's side of it.
    pub async fn send_stream<R, F>(
        &self,
        entity_id: impl Into<EntityId>,
        make: F,
    ) -> Result<BoxStream<'static, Result<R, ShardingError>>, ShardingError>
    where
        R: DeserializeOwned + Send + 'static,
        F: FnOnce(StreamReplier<R>) -> Msg,
    {
        let entity_id = entity_id.into();
        let reply_id = self.sharding.next_reply_id();
        let msg = make(StreamReplier::new(reply_id.clone()));
        let mut message = self.binary(&entity_id, &msg)?;
        message.reply_id = Some(reply_id);

        let chunks = self
            .timed(&entity_id, self.sharding.route_stream(message))
            .await?;
        Ok(chunks
            .map(|chunk| chunk.and_then(|bytes| decode(&bytes)))
            .boxed())
    }

    /// Like [`send_stream`](Self::send_stream), but transparently reopens the
    /// stream when the hosting pod becomes unavailable.
    ///
    /// `cursor` tracks progress: each item advances it through `update`, and
    /// a reopened stream is requested with the last cursor seen. Reopening
    /// waits `stream_restart_delay` first. Any other error ends the stream.
    pub fn send_stream_auto_restart<C, R, B, U>(
        &self,
        entity_id: impl Into<EntityId>,
        cursor: C,
        build: B,
        update: U,
    ) -> BoxStream<'static, Result<R, ShardingError>>
    where
        C: Clone + Send + Sync + 'static,
        R: DeserializeOwned + Send + 'static,
        B: Fn(&C, StreamReplier<R>) -> Msg + Send + Sync + 'static,
        U: Fn(&C, &R) -> C + Send + Sync + 'static,
    {
        let messenger = self.clone();
        let entity_id = entity_id.into();
        let build = Arc::new(build);
        let delay = self.sharding.config().stream_restart_delay;
        auto_restart(
            cursor,
            move |cursor: C| {
                let messenger = messenger.clone();
                let entity_id = entity_id.clone();
                let build = Arc::clone(&build);
                async move {
                    messenger
                        .send_stream(entity_id, move |replier| build(&cursor, replier))
                        .await
                }
            },
            update,
            delay,
        )
    }

    fn binary(&self, entity_id: &EntityId, msg: &Msg) -> Result<BinaryMessage, ShardingError> {
        Ok(BinaryMessage {
            entity_id: entity_id.clone(),
            recipient_type: self.recipient_type.name().to_string(),
            body: encode(msg)?,
            reply_id: None,
        })
    }

    async fn timed<T>(
        &self,
        entity_id: &EntityId,
        fut: impl Future<Output = Result<T, ShardingError>>,
    ) -> Result<T, ShardingError> {
        let timeout = self.send_timeout();
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| ShardingError::SendTimeout {
                entity_id: entity_id.clone(),
                timeout,
            })?
    }
}

enum RestartState<C, R> {
    Closed(C),
    Open(C, BoxStream<'static, Result<R, ShardingError>>),
    Done,
}

/// Drives a resumable stream: `open` is called with the current cursor
/// whenever the stream must be (re)opened, `update` advances the cursor per
/// item. `PodUnavailable` triggers a reopen after `delay`; any other error
/// is yielded and ends the stream.
pub fn auto_restart<C, R, O, Fut, U>(
    cursor: C,
    open: O,
    update: U,
    delay: Duration,
) -> BoxStream<'static, Result<R, ShardingError>>
where
    C: Clone + Send + 'static,
    R: Send + 'static,
    O: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<R, ShardingError>>, ShardingError>>
        + Send
        + 'static,
    U: Fn(&C, &R) -> C + Send + Sync + 'static,
{
    futures::stream::unfold(
        (RestartState::Closed(cursor), open, update),
        move |(mut state, open, update)| async move {
            loop {
                match state {
                    RestartState::Done => return None,
                    RestartState::Closed(cursor) => match open(cursor.clone()).await {
                        Ok(stream) => state = RestartState::Open(cursor, stream),
                        Err(err @ ShardingError::PodUnavailable { .. }) => {
                            tracing::debug!(error = %err, "stream pod unavailable, reopening");
                            tokio::time::sleep(delay).await;
                            state = RestartState::Closed(cursor);
                        }
                        Err(err) => return Some((Err(err), (RestartState::Done, open, update))),
                    },
                    RestartState::Open(cursor, mut stream) => match stream.next().await {
                        Some(Ok(item)) => {
                            let next = update(&cursor, &item);
                            return Some((Ok(item), (RestartState::Open(next, stream), open, update)));
                        }
                        Some(Err(err @ ShardingError::PodUnavailable { .. })) => {
                            tracing::debug!(error = %err, "stream interrupted, reopening");
                            tokio::time::sleep(delay).await;
                            state = RestartState::Closed(cursor);
                        }
                        Some(Err(err)) => {
                            return Some((Err(err), (RestartState::Done, open, update)))
                        }
                        None => return None,
                    },
                }
            }
        },
    )
    .boxed()
}

/// Sends messages of type `Msg` to a topic on every pod of the cluster.
pub struct Broadcaster<Msg> {
    sharding: Arc<Sharding>,
    recipient_type: RecipientType<Msg>,
    timeout: Option<Duration>,
}

impl<Msg> Clone for Broadcaster<Msg> {
    fn clone(&self) -> Self {
        Self {
            sharding: Arc::clone(&self.sharding),
            recipient_type: self.recipient_type.clone(),
            timeout: self.timeout,
        }
    }
}

impl<Msg: Message> Broadcaster<Msg> {
    pub(crate) fn new(sharding: Arc<Sharding>, recipient_type: RecipientType<Msg>) -> Self {
        Self {
            sharding,
            recipient_type,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pods owning at least one shard, which is where topic subscribers run.
    fn targets(&self) -> Vec<PodAddress> {
        self.sharding.cache().pods().into_iter().collect()
    }

    fn send_timeout(&self) -> Duration {
        self.timeout
            .unwrap_or(self.sharding.config().send_timeout)
    }

    /// Delivers `msg` to the topic on every pod, one attempt each. Failures
    /// are logged, not returned.
    pub async fn broadcast_discard(
        &self,
        topic: impl Into<EntityId>,
        msg: Msg,
    ) -> Result<(), ShardingError> {
        let topic = topic.into();
        let body = encode(&msg)?;
        let timeout = self.send_timeout();
        let sends = self.targets().into_iter().map(|pod| {
            let message = BinaryMessage {
                entity_id: topic.clone(),
                recipient_type: self.recipient_type.name().to_string(),
                body: body.clone(),
                reply_id: None,
            };
            async move {
                let result = tokio::time::timeout(timeout, self.sharding.send_to_pod(pod.clone(), message)).await;
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => {
                        tracing::warn!(pod = %pod, error = %err, "broadcast delivery failed");
                    }
                    Err(_) => tracing::warn!(pod = %pod, "broadcast delivery timed out"),
                }
            }
        });
        join_all(sends).await;
        Ok(())
    }

    /// Sends the message built by `make` to the topic on every pod and
    /// collects each pod's reply.
    pub async fn broadcast<R, F>(
        &self,
        topic: impl Into<EntityId>,
        make: F,
    ) -> Result<HashMap<PodAddress, Result<R, ShardingError>>, ShardingError>
    where
        R: DeserializeOwned,
        F: Fn(Replier<R>) -> Msg,
    {
        let topic = topic.into();
        let timeout = self.send_timeout();
        let mut sends = Vec::new();
        for pod in self.targets() {
            let reply_id = self.sharding.next_reply_id();
            let msg = make(Replier::new(reply_id.clone()));
            let message = BinaryMessage {
                entity_id: topic.clone(),
                recipient_type: self.recipient_type.name().to_string(),
                body: encode(&msg)?,
                reply_id: Some(reply_id),
            };
            let topic = topic.clone();
            sends.push(async move {
                let result = match tokio::time::timeout(
                    timeout,
                    self.sharding.send_to_pod(pod.clone(), message),
                )
                .await
                {
                    Ok(Ok(Some(bytes))) => decode(&bytes),
                    Ok(Ok(None)) => Err(ShardingError::MessageReturnedNothing { entity_id: topic }),
                    Ok(Err(err)) => Err(err),
                    Err(_) => Err(ShardingError::SendTimeout {
                        entity_id: topic,
                        timeout,
                    }),
                };
                (pod, result)
            });
        }
        Ok(join_all(sends).await.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn unavailable() -> ShardingError {
        ShardingError::unavailable(&PodAddress::new("gone", 1))
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resumes_from_last_cursor() {
        let opened_with = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = Arc::clone(&opened_with);
        let stream = auto_restart(
            0u32,
            move |cursor: u32| {
                log.lock().push(cursor);
                async move {
                    // First connection drops after two items.
                    let items: Vec<Result<u32, ShardingError>> = if cursor == 0 {
                        vec![Ok(1), Ok(2), Err(unavailable())]
                    } else {
                        (cursor + 1..=5).map(Ok).collect()
                    };
                    Ok(futures::stream::iter(items).boxed())
                }
            },
            |_cursor, item| *item,
            Duration::from_millis(200),
        );

        let items: Vec<u32> = stream.map(|item| item.unwrap()).collect().await;
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
        assert_eq!(*opened_with.lock(), vec![0, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_retries_failed_opens() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let stream = auto_restart(
            (),
            move |_| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(unavailable())
                    } else {
                        Ok(futures::stream::iter(vec![Ok(7u8)]).boxed())
                    }
                }
            },
            |_, _| (),
            Duration::from_millis(200),
        );

        let items: Vec<Result<u8, ShardingError>> = stream.collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(*items[0].as_ref().unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_end_the_stream() {
        let stream = auto_restart(
            (),
            |_| async {
                Ok(futures::stream::iter(vec![
                    Ok(1u8),
                    Err(ShardingError::ShuttingDown),
                    Ok(2u8),
                ])
                .boxed())
            },
            |_, _| (),
            Duration::from_millis(1),
        );

        let items: Vec<Result<u8, ShardingError>> = stream.collect().await;
        assert_eq!(items.len(), 2);
        assert!(matches!(items[1], Err(ShardingError::ShuttingDown)));
    }
}
