// iSECTECH Security Integrations - Metrics
// Counters, gauges and histograms for collection and deployment monitoring
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Metrics sink for the integration core.
//!
//! The core only writes metrics; readers are dashboards, exporters and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Well-known metric names
pub mod names {
    pub const EVENTS_COLLECTED: &str = "collector_events_collected_total";
    pub const EVENTS_PUBLISHED: &str = "collector_events_published_total";
    pub const VALIDATION_FAILURES: &str = "collector_validation_failures_total";
    pub const PUBLISH_FAILURES: &str = "collector_publish_failures_total";
    pub const BUFFER_FULL: &str = "collector_buffer_full_total";
    pub const BATCHES_FLUSHED: &str = "collector_batches_flushed_total";
    pub const BATCH_SIZE: &str = "collector_batch_size";
    pub const BUFFER_OCCUPANCY: &str = "collector_buffer_occupancy";
    pub const COLLECTION_LATENCY_MS: &str = "collector_collection_latency_ms";
    pub const PUBLISH_LATENCY_MS: &str = "collector_publish_latency_ms";

    pub const DEPLOYMENTS_STARTED: &str = "deployer_deployments_started_total";
    pub const DEPLOYMENTS_SUCCEEDED: &str = "deployer_deployments_succeeded_total";
    pub const DEPLOYMENTS_FAILED: &str = "deployer_deployments_failed_total";
    pub const DEPLOYMENTS_REJECTED: &str = "deployer_deployments_rejected_total";
    pub const DEPLOYMENT_RETRIES: &str = "deployer_retries_total";
    pub const DEPLOYMENT_DURATION_MS: &str = "deployer_deployment_duration_ms";
    pub const ACTIVE_DEPLOYMENTS: &str = "deployer_active_deployments";
    pub const ACTIVE_INTEGRATIONS: &str = "manager_active_integrations";

    pub const VALIDATION_CACHE_HITS: &str = "validation_cache_hits_total";
    pub const VALIDATION_CACHE_MISSES: &str = "validation_cache_misses_total";
}

/// Summary of observed values for one histogram
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
}

impl HistogramSummary {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    /// Mean of observed values
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Point-in-time copy of every metric
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
    pub uptime: Duration,
}

impl MetricsSnapshot {
    /// Counter value, zero when never incremented
    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    /// Gauge value, zero when never set
    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.get(name).copied().unwrap_or(0.0)
    }
}

/// Metrics collector shared across components
pub struct MetricsCollector {
    /// Monotonic counters
    counters: Arc<RwLock<HashMap<String, u64>>>,
    /// Gauge metrics
    gauges: Arc<RwLock<HashMap<String, f64>>>,
    /// Histogram summaries
    histograms: Arc<RwLock<HashMap<String, HistogramSummary>>>,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            counters: Arc::new(RwLock::new(HashMap::new())),
            gauges: Arc::new(RwLock::new(HashMap::new())),
            histograms: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Increment a counter metric
    pub async fn increment_counter(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    /// Set a gauge metric
    pub async fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    /// Record one histogram observation
    pub async fn observe(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write().await;
        histograms.entry(name.to_string()).or_default().observe(value);
    }

    /// Record a duration in milliseconds
    pub async fn observe_duration(&self, name: &str, duration: Duration) {
        self.observe(name, duration.as_secs_f64() * 1000.0).await;
    }

    /// Read a single counter
    pub async fn counter(&self, name: &str) -> u64 {
        self.counters.read().await.get(name).copied().unwrap_or(0)
    }

    /// Copy every metric
    pub async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().await.clone(),
            gauges: self.gauges.read().await.clone(),
            histograms: self.histograms.read().await.clone(),
            uptime: self.start_time.elapsed(),
        }
    }

    /// Export metrics in Prometheus text format
    pub async fn export_prometheus(&self) -> String {
        let snapshot = self.snapshot().await;
        let mut output = String::new();

        let mut counters: Vec<_> = snapshot.counters.iter().collect();
        counters.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in counters {
            output.push_str(&format!(
                "# TYPE isectech_integrations_{} counter\nisectech_integrations_{} {}\n",
                name, name, value
            ));
        }

        let mut gauges: Vec<_> = snapshot.gauges.iter().collect();
        gauges.sort_by(|a, b| a.0.cmp(b.0));
        for (name, value) in gauges {
            output.push_str(&format!(
                "# TYPE isectech_integrations_{} gauge\nisectech_integrations_{} {}\n",
                name, name, value
            ));
        }

        let mut histograms: Vec<_> = snapshot.histograms.iter().collect();
        histograms.sort_by(|a, b| a.0.cmp(b.0));
        for (name, summary) in histograms {
            output.push_str(&format!(
                "# TYPE isectech_integrations_{name} summary\n\
                 isectech_integrations_{name}_count {}\n\
                 isectech_integrations_{name}_sum {}\n",
                summary.count, summary.sum
            ));
        }

        output.push_str(&format!(
            "# TYPE isectech_integrations_uptime_seconds gauge\nisectech_integrations_uptime_seconds {}\n",
            snapshot.uptime.as_secs()
        ));

        output
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_and_gauges() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter(names::EVENTS_COLLECTED, 2).await;
        metrics.increment_counter(names::EVENTS_COLLECTED, 3).await;
        metrics.set_gauge(names::BUFFER_OCCUPANCY, 0.5).await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.counter(names::EVENTS_COLLECTED), 5);
        assert_eq!(snapshot.gauge(names::BUFFER_OCCUPANCY), 0.5);
        assert_eq!(snapshot.counter("missing"), 0);
    }

    #[tokio::test]
    async fn test_histogram_summary() {
        let metrics = MetricsCollector::new();
        for value in [4.0, 1.0, 7.0] {
            metrics.observe(names::BATCH_SIZE, value).await;
        }

        let snapshot = metrics.snapshot().await;
        let summary = &snapshot.histograms[names::BATCH_SIZE];
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 7.0);
        assert_eq!(summary.mean(), 4.0);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let metrics = MetricsCollector::new();
        metrics.increment_counter(names::BATCHES_FLUSHED, 1).await;
        metrics.observe(names::PUBLISH_LATENCY_MS, 12.0).await;

        let output = metrics.export_prometheus().await;
        assert!(output.contains("isectech_integrations_collector_batches_flushed_total 1"));
        assert!(output.contains("isectech_integrations_collector_publish_latency_ms_count 1"));
        assert!(output.contains("uptime_seconds"));
    }
}
