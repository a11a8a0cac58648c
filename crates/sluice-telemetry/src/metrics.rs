use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Well-known metric names recorded by the hub and server.
pub mod names {
    pub const JOBS_CREATED: &str = "jobs_created";
    pub const JOBS_ATTACHED: &str = "jobs_attached";
    pub const JOBS_FAILED: &str = "jobs_failed";
    pub const JOBS_EVICTED: &str = "jobs_evicted";
    pub const JOBS_RUNNING: &str = "jobs_running";
    pub const EVENTS_APPENDED: &str = "events_appended";
    pub const SUBSCRIBERS_ACTIVE: &str = "subscribers_active";
    pub const RECORD_FAILURES: &str = "record_failures";
}

/// Point-in-time copy of every metric.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, i64>,
}

/// Process-wide counters and gauges. Lock-free on the hot path; a metric is
/// created on first touch.
#[derive(Debug, Default)]
pub struct HubMetrics {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by n.
    pub fn counter_inc(&self, name: &str, n: u64) {
        if let Some(c) = self.counters.get(name) {
            c.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    /// Move a gauge up or down by delta.
    pub fn gauge_inc(&self, name: &str, delta: i64) {
        if let Some(g) = self.gauges.get(name) {
            g.fetch_add(delta, Ordering::Relaxed);
            return;
        }
        self.gauges
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(delta, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str) -> u64 {
        self.counters.get(name).map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_get(&self, name: &str) -> i64 {
        self.gauges.get(name).map_or(0, |g| g.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self
                .counters
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            gauges: self
                .gauges
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
        }
    }
}
