use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::PodAddress;

/// A registered cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub address: PodAddress,
    /// Dotted numeric software version, e.g. `"1.4.2"`.
    pub version: String,
}

impl Pod {
    pub fn new(address: PodAddress, version: impl Into<String>) -> Self {
        Self {
            address,
            version: version.into(),
        }
    }
}

/// A pod as tracked by the shard manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodWithMetadata {
    pub pod: Pod,
    pub registered: DateTime<Utc>,
}

impl PodWithMetadata {
    pub fn new(pod: Pod, registered: DateTime<Utc>) -> Self {
        Self { pod, registered }
    }

    pub fn address(&self) -> &PodAddress {
        &self.pod.address
    }

    pub fn version(&self) -> &str {
        &self.pod.version
    }
}

/// Compares two dotted versions segment by segment as integers.
///
/// Missing and non-numeric segments count as 0, so `"1.2" == "1.2.0"`.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|segment| segment.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
