use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub struct ResourceStats {
    pub deliveries: AtomicU64,
    pub last_delivery: RwLock<Option<Instant>>,
}

impl ResourceStats {
    fn new() -> Self {
        Self {
            deliveries: AtomicU64::new(0),
            last_delivery: RwLock::new(None),
        }
    }

    fn record_delivery(&self) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        *self.last_delivery.write() = Some(Instant::now());
    }
}

/// Counters for the synchronization engine: subscription churn and delivery
/// volume, globally and per resource key.
pub struct EngineMetrics {
    resources: DashMap<String, Arc<ResourceStats>>,
    subscribes: AtomicU64,
    unsubscribes: AtomicU64,
    failures: AtomicU64,
    deliveries: AtomicU64,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            subscribes: AtomicU64::new(0),
            unsubscribes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            deliveries: AtomicU64::new(0),
        }
    }

    pub fn record_subscribe(&self) {
        self.subscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsubscribe(&self) {
        self.unsubscribes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, resource: &str) {
        self.deliveries.fetch_add(1, Ordering::Relaxed);
        self.resources
            .entry(resource.to_string())
            .or_insert_with(|| Arc::new(ResourceStats::new()))
            .record_delivery();
    }

    pub fn resource_deliveries(&self, resource: &str) -> u64 {
        self.resources
            .get(resource)
            .map(|stats| stats.deliveries.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tracked_resources: self.resources.len(),
            subscribes: self.subscribes.load(Ordering::Relaxed),
            unsubscribes: self.unsubscribes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub tracked_resources: usize,
    pub subscribes: u64,
    pub unsubscribes: u64,
    pub failures: u64,
    pub deliveries: u64,
}

impl MetricsSnapshot {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "tracked_resources": self.tracked_resources,
            "subscribes": self.subscribes,
            "unsubscribes": self.unsubscribes,
            "failures": self.failures,
            "deliveries": self.deliveries,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_per_resource_and_globally() {
        let metrics = EngineMetrics::new();
        metrics.record_subscribe();
        metrics.record_delivery("c1/alice");
        metrics.record_delivery("c1/alice");
        metrics.record_delivery("c2/bob");

        assert_eq!(metrics.resource_deliveries("c1/alice"), 2);
        assert_eq!(metrics.resource_deliveries("c2/bob"), 1);
        assert_eq!(metrics.resource_deliveries("c3/carol"), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.deliveries, 3);
        assert_eq!(snapshot.subscribes, 1);
        assert_eq!(snapshot.tracked_resources, 2);
        assert_eq!(snapshot.to_json()["deliveries"], 3);
    }
}
