#![allow(dead_code)]

use std::time::Duration;

use shardpod::prelude::*;
use tracing_subscriber::EnvFilter;

/// Messages understood by the test counter entity.
#[derive(Debug, Serialize, Deserialize)]
pub enum CounterMsg {
    Increment,
    Get(Replier<u64>),
    /// Replies with the address of the pod hosting the entity.
    WhereAreYou(Replier<String>),
    /// Streams the three numbers after the given one.
    CountFrom(u32, StreamReplier<u32>),
    /// Streams numbers after the given one, one every few milliseconds, forever.
    Ticks(u32, StreamReplier<u32>),
    /// Stops the entity without answering.
    StopWithoutReply(Replier<u64>),
    /// Keeps running but never answers.
    IgnoreReply(Replier<u64>),
}

pub fn counter_type() -> RecipientType<CounterMsg> {
    RecipientType::entity("Counter")
}

pub async fn counter(ctx: RecipientContext, mut mailbox: Mailbox<CounterMsg>, host: String) {
    let mut count = 0u64;
    while let Some(msg) = mailbox.recv().await {
        match msg {
            CounterMsg::Increment => count += 1,
            CounterMsg::Get(replier) => {
                let _ = ctx.reply(&replier, &count);
            }
            CounterMsg::WhereAreYou(replier) => {
                let _ = ctx.reply(&replier, &host);
            }
            CounterMsg::CountFrom(from, replier) => {
                ctx.reply_stream(&replier, futures::stream::iter(from + 1..=from + 3));
            }
            CounterMsg::Ticks(from, replier) => {
                let ticks = futures::stream::unfold(from, |n| async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    Some((n + 1, n + 1))
                });
                ctx.reply_stream(&replier, ticks);
            }
            CounterMsg::StopWithoutReply(_) => return,
            CounterMsg::IgnoreReply(_) => {}
        }
    }
}

pub fn register_counter(pod: &Sharding) {
    let host = pod.address().to_string();
    pod.register_entity(&counter_type(), move |ctx, mailbox| {
        counter(ctx, mailbox, host.clone())
    })
    .expect("counter registration");
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
