//! Cluster singletons.
//!
//! A singleton runs on exactly one pod: the current owner of shard 1.
//! [`Singletons`] keeps the pod's registered singletons and reconciles them
//! whenever that ownership changes.
//!
//! Singletons receive a [`SingletonContext`] with a cancellation token.
//! A singleton that asks for the token is awaited on stop, up to the stop
//! timeout, and aborted after that. One that never asks is aborted at once.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Context passed to a singleton each time it is started.
pub struct SingletonContext {
    cancel: CancellationToken,
    managed: Arc<AtomicBool>,
}

impl SingletonContext {
    fn new(cancel: CancellationToken, managed: Arc<AtomicBool>) -> Self {
        Self { cancel, managed }
    }

    /// Returns the token cancelled when this pod stops hosting the singleton.
    ///
    /// Calling this opts in to graceful shutdown: the pod waits for the
    /// singleton to return instead of aborting it.
    pub fn cancellation(&self) -> CancellationToken {
        self.managed.store(true, Ordering::Release);
        self.cancel.clone()
    }

    /// Check for cancellation without opting in to graceful shutdown.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A reusable singleton body, called again on every start.
pub type SingletonRun = Arc<dyn Fn(SingletonContext) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) fn singleton_run<F, Fut>(run: F) -> SingletonRun
where
    F: Fn(SingletonContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| run(ctx).boxed())
}

struct Running {
    cancel: CancellationToken,
    managed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct SingletonEntry {
    name: String,
    run: SingletonRun,
    running: Option<Running>,
}

impl SingletonEntry {
    fn start(&mut self) {
        let cancel = CancellationToken::new();
        let managed = Arc::new(AtomicBool::new(false));
        let ctx = SingletonContext::new(cancel.clone(), Arc::clone(&managed));
        let body = std::panic::AssertUnwindSafe((self.run)(ctx)).catch_unwind();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            if body.await.is_err() {
                tracing::error!(name = %name, "singleton panicked");
            } else {
                tracing::debug!(name = %name, "singleton completed");
            }
        });
        tracing::info!(name = %self.name, "started singleton");
        self.running = Some(Running {
            cancel,
            managed,
            handle,
        });
    }

    async fn stop(&mut self, timeout: Duration) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if running.managed.load(Ordering::Acquire) {
            tracing::debug!(name = %self.name, "waiting for singleton to shut down");
            match tokio::time::timeout(timeout, &mut running.handle).await {
                Ok(Err(err)) if err.is_panic() => {
                    tracing::error!(name = %self.name, "singleton panicked during shutdown");
                }
                Ok(_) => {}
                Err(_) => {
                    tracing::warn!(
                        name = %self.name,
                        timeout_ms = timeout.as_millis() as u64,
                        "singleton ignored cancellation, aborting it"
                    );
                    running.handle.abort();
                }
            }
        } else {
            running.handle.abort();
        }
        tracing::info!(name = %self.name, "stopped singleton");
    }
}

/// The singletons registered on one pod.
pub(crate) struct Singletons {
    entries: Mutex<Vec<SingletonEntry>>,
    stop_timeout: Duration,
}

impl Singletons {
    /// `stop_timeout` bounds the wait for a singleton that took its
    /// cancellation token.
    pub(crate) fn new(stop_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            stop_timeout,
        }
    }

    pub(crate) async fn register(&self, name: String, run: SingletonRun) {
        let mut entries = self.entries.lock().await;
        if let Some(existing) = entries.iter_mut().find(|entry| entry.name == name) {
            tracing::warn!(name = %name, "singleton registered twice, replacing it");
            existing.stop(self.stop_timeout).await;
            existing.run = run;
        } else {
            entries.push(SingletonEntry {
                name,
                run,
                running: None,
            });
        }
    }

    /// Starts every stopped singleton when `desired`, stops every running one
    /// otherwise. Returns the number running afterwards.
    pub(crate) async fn reconcile(&self, desired: bool) -> usize {
        let mut entries = self.entries.lock().await;
        for entry in entries.iter_mut() {
            match (&entry.running, desired) {
                (None, true) => entry.start(),
                (Some(_), false) => entry.stop(self.stop_timeout).await,
                _ => {}
            }
        }
        entries.iter().filter(|entry| entry.running.is_some()).count()
    }
}
