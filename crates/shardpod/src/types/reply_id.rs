use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::PodAddress;

/// Correlates one outgoing request with its response(s).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplyId(pub String);

impl fmt::Display for ReplyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates cluster-unique [`ReplyId`]s.
///
/// Ids are `<pod>/<start millis>/<sequence>`. The start timestamp keeps ids
/// distinct across restarts of a pod on the same address.
#[derive(Debug)]
pub struct ReplyIdGenerator {
    prefix: String,
    sequence: AtomicU64,
}

impl ReplyIdGenerator {
    pub fn new(pod: &PodAddress) -> Self {
        Self {
            prefix: format!("{}/{}", pod, chrono::Utc::now().timestamp_millis()),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn next_id(&self) -> ReplyId {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        ReplyId(format!("{}/{}", self.prefix, seq))
    }
}
