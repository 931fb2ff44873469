use prometheus::{IntGauge, Opts, Registry};

/// Prometheus gauges for the shard manager and pods.
pub struct ClusterMetrics {
    /// Pods registered with the shard manager.
    pub pods: IntGauge,
    /// Shards with no owner in the shard manager's state.
    pub unassigned_shards: IntGauge,
    /// Shards owned by this pod.
    pub shards: IntGauge,
    /// Live entity instances on this pod.
    pub entities: IntGauge,
    /// Singletons running on this pod.
    pub singletons: IntGauge,
}

impl ClusterMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.pods.clone()))?;
        registry.register(Box::new(metrics.unassigned_shards.clone()))?;
        registry.register(Box::new(metrics.shards.clone()))?;
        registry.register(Box::new(metrics.entities.clone()))?;
        registry.register(Box::new(metrics.singletons.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            pods: IntGauge::with_opts(Opts::new("shardpod_pods", "Registered pods"))?,
            unassigned_shards: IntGauge::with_opts(Opts::new(
                "shardpod_unassigned_shards",
                "Shards without an owner",
            ))?,
            shards: IntGauge::with_opts(Opts::new(
                "shardpod_shards",
                "Shards owned by this pod",
            ))?,
            entities: IntGauge::with_opts(Opts::new(
                "shardpod_entities",
                "Live entity instances on this pod",
            ))?,
            singletons: IntGauge::with_opts(Opts::new(
                "shardpod_singletons",
                "Singletons running on this pod",
            ))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = ClusterMetrics::unregistered();
        m.entities.set(5);
        assert_eq!(m.entities.get(), 5);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = ClusterMetrics::new(&r).unwrap();
        m.pods.set(3);
        let families = r.gather();
        assert_eq!(families.len(), 5);
        assert!(families.iter().any(|f| f.get_name() == "shardpod_pods"));
    }

    #[test]
    fn double_registration_fails() {
        let r = Registry::new();
        let _m = ClusterMetrics::new(&r).unwrap();
        assert!(ClusterMetrics::new(&r).is_err());
    }
}
