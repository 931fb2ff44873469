use crate::error::ShardingError;
use crate::types::PodAddress;
use std::time::Duration;

/// Configuration for one pod's sharding runtime.
#[derive(Debug, Clone)]
pub struct ShardingConfig {
    /// Address this pod advertises to the shard manager and other pods.
    pub address: PodAddress,
    /// Software version reported on registration. Balance-mode rebalancing
    /// only runs while every pod reports the highest version. Default: "1.0.0".
    pub version: String,
    /// Total number of shards. Must match the shard manager. Default: 300.
    pub number_of_shards: u32,
    /// Idle time after which a local entity is terminated. Default: 1 min.
    pub entity_max_idle_time: Duration,
    /// How long an entity gets to drain its mailbox after receiving a poison
    /// pill before its scope is cancelled. Default: 3s.
    pub entity_termination_timeout: Duration,
    /// Default timeout for messenger sends. Default: 10s.
    pub send_timeout: Duration,
    /// Delay before re-subscribing to the assignment feed after it fails. Default: 5s.
    pub refresh_assignments_retry_interval: Duration,
    /// Delay before retrying when a shard has no known owner yet. Default: 100ms.
    pub unresolved_retry_interval: Duration,
    /// Delay before retrying a send that hit a routing race or an
    /// unavailable pod. Default: 200ms.
    pub send_retry_interval: Duration,
    /// Delay before retrying delivery to an entity that is being torn down. Default: 100ms.
    pub entity_restart_backoff: Duration,
    /// Delay before restarting an auto-restart stream after `PodUnavailable`. Default: 200ms.
    pub stream_restart_delay: Duration,
}

impl ShardingConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `number_of_shards >= 1`
    /// - `version` is not empty
    /// - all timeouts and intervals are non-zero
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards < 1 {
            return Err(ShardingError::InvalidConfig {
                reason: format!(
                    "number_of_shards must be >= 1, got {}",
                    self.number_of_shards
                ),
            });
        }
        if self.version.trim().is_empty() {
            return Err(ShardingError::InvalidConfig {
                reason: "version must not be empty".to_string(),
            });
        }
        let durations = [
            ("entity_max_idle_time", self.entity_max_idle_time),
            ("entity_termination_timeout", self.entity_termination_timeout),
            ("send_timeout", self.send_timeout),
            (
                "refresh_assignments_retry_interval",
                self.refresh_assignments_retry_interval,
            ),
            ("unresolved_retry_interval", self.unresolved_retry_interval),
            ("send_retry_interval", self.send_retry_interval),
            ("entity_restart_backoff", self.entity_restart_backoff),
            ("stream_restart_delay", self.stream_restart_delay),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ShardingError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        Ok(())
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            address: PodAddress::new("localhost", 54321),
            version: "1.0.0".to_string(),
            number_of_shards: 300,
            entity_max_idle_time: Duration::from_secs(60),
            entity_termination_timeout: Duration::from_secs(3),
            send_timeout: Duration::from_secs(10),
            refresh_assignments_retry_interval: Duration::from_secs(5),
            unresolved_retry_interval: Duration::from_millis(100),
            send_retry_interval: Duration::from_millis(200),
            entity_restart_backoff: Duration::from_millis(100),
            stream_restart_delay: Duration::from_millis(200),
        }
    }
}

/// Configuration for the shard manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Total number of shards. Fixed for the lifetime of the cluster. Default: 300.
    pub number_of_shards: u32,
    /// Interval of the background balance-mode rebalance. Default: 20s.
    pub rebalance_interval: Duration,
    /// Delay before retrying an immediate rebalance that had failed pods. Default: 10s.
    pub rebalance_retry_interval: Duration,
    /// Timeout for pinging pods before moving shards. Default: 3s.
    pub ping_timeout: Duration,
    /// Timeout for a pod to acknowledge an assignment or unassignment.
    /// A pod that misses it is treated as failed for that pass. Default: 10s.
    pub pod_operation_timeout: Duration,
    /// Spacing between persistence retries. Default: 3s.
    pub persist_retry_interval: Duration,
    /// Number of persistence retries before giving up. Default: 100.
    pub persist_retry_count: u32,
    /// Fraction of all shards that a single balance-mode pass may move.
    /// Must be in `(0, 1]`. Default: 0.02.
    pub rebalance_rate: f64,
    /// Interval of the background health check over all pods. Default: 1 min.
    pub pod_health_check_interval: Duration,
    /// Maximum number of pods probed at once by a health check. Default: 4.
    pub health_check_concurrency: usize,
}

impl ManagerConfig {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ShardingError> {
        if self.number_of_shards < 1 {
            return Err(ShardingError::InvalidConfig {
                reason: format!(
                    "number_of_shards must be >= 1, got {}",
                    self.number_of_shards
                ),
            });
        }
        if !(self.rebalance_rate > 0.0 && self.rebalance_rate <= 1.0) {
            return Err(ShardingError::InvalidConfig {
                reason: format!(
                    "rebalance_rate must be in (0, 1], got {}",
                    self.rebalance_rate
                ),
            });
        }
        if self.health_check_concurrency == 0 {
            return Err(ShardingError::InvalidConfig {
                reason: "health_check_concurrency must be >= 1".to_string(),
            });
        }
        let durations = [
            ("rebalance_interval", self.rebalance_interval),
            ("rebalance_retry_interval", self.rebalance_retry_interval),
            ("ping_timeout", self.ping_timeout),
            ("pod_operation_timeout", self.pod_operation_timeout),
            ("persist_retry_interval", self.persist_retry_interval),
            ("pod_health_check_interval", self.pod_health_check_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(ShardingError::InvalidConfig {
                    reason: format!("{name} must be > 0"),
                });
            }
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            number_of_shards: 300,
            rebalance_interval: Duration::from_secs(20),
            rebalance_retry_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(3),
            pod_operation_timeout: Duration::from_secs(10),
            persist_retry_interval: Duration::from_secs(3),
            persist_retry_count: 100,
            rebalance_rate: 2.0 / 100.0,
            pod_health_check_interval: Duration::from_secs(60),
            health_check_concurrency: 4,
        }
    }
}
