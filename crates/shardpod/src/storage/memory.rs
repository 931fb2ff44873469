use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;

use crate::cluster_storage::{Assignments, ClusterStorage};
use crate::error::ShardingError;
use crate::pod::Pod;

/// In-memory cluster storage for testing and single-process clusters.
///
/// Every saved assignment table is pushed to all open assignment streams.
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    failing: AtomicBool,
}

struct Inner {
    pods: Vec<Pod>,
    assignments: Assignments,
    /// Watchers to notify on assignment changes.
    watchers: Vec<tokio::sync::mpsc::UnboundedSender<Assignments>>,
    saves: usize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pods: Vec::new(),
                assignments: Assignments::new(),
                watchers: Vec::new(),
                saves: 0,
            }),
            failing: AtomicBool::new(false),
        }
    }

    /// Storage pre-populated with pods and assignments, as left behind by a
    /// previous shard manager.
    pub fn with_state(pods: Vec<Pod>, assignments: Assignments) -> Self {
        let storage = Self::new();
        {
            let mut inner = storage.inner.lock();
            inner.pods = pods;
            inner.assignments = assignments;
        }
        storage
    }

    /// While set, every write fails with `StoragePersistError`.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Number of successful writes so far.
    pub fn save_count(&self) -> usize {
        self.inner.lock().saves
    }

    fn check_writable(&self) -> Result<(), ShardingError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(ShardingError::StoragePersistError {
                reason: "memory storage is in failing mode".to_string(),
                source: None,
            });
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterStorage for MemoryStorage {
    async fn get_pods(&self) -> Result<Vec<Pod>, ShardingError> {
        Ok(self.inner.lock().pods.clone())
    }

    async fn save_pods(&self, pods: Vec<Pod>) -> Result<(), ShardingError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.pods = pods;
        inner.saves += 1;
        Ok(())
    }

    async fn get_assignments(&self) -> Result<Assignments, ShardingError> {
        Ok(self.inner.lock().assignments.clone())
    }

    async fn save_assignments(&self, assignments: Assignments) -> Result<(), ShardingError> {
        self.check_writable()?;
        let mut inner = self.inner.lock();
        inner.assignments = assignments.clone();
        inner.saves += 1;
        inner
            .watchers
            .retain(|tx| tx.send(assignments.clone()).is_ok());
        Ok(())
    }

    async fn assignments_stream(
        &self,
    ) -> Result<Pin<Box<dyn Stream<Item = Assignments> + Send>>, ShardingError> {
        let mut inner = self.inner.lock();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        inner.watchers.push(tx);
        Ok(Box::pin(
            tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
        ))
    }
}
