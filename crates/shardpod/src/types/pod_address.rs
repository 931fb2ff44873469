use serde::{Deserialize, Serialize};
use std::fmt;

/// Network identity of a cluster member (host:port).
///
/// Ordered by host then port so that tie-breaks between pods are deterministic.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PodAddress {
    pub host: String,
    pub port: u16,
}

impl PodAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PodAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
