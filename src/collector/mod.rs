// iSECTECH Security Integrations - Event Collectors
// Buffering, validation and publication of platform events
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Event collectors sitting between platform adapters and the streaming layer.
//!
//! Two strategies share one lifecycle and one publish path:
//!
//! - [`BatchCollector`] buffers events in memory, validates a full batch on a
//!   fixed worker pool and publishes the valid subset.
//! - [`RealtimeCollector`] validates each event on arrival, applies
//!   backpressure through a bounded channel and publishes from a drain task.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ErrorContext, IntegrationError, Result};
use crate::metrics::{names, MetricsCollector};
use crate::retry::{execute_with_retry, RetryPolicy};
use crate::streaming::StreamProducer;

pub mod batch;
pub mod realtime;

pub use batch::BatchCollector;
pub use realtime::RealtimeCollector;

/// Collector lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    Initialized,
    Running,
    Paused,
    Stopped,
    Error,
}

impl fmt::Display for CollectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CollectorState::Initialized => "initialized",
            CollectorState::Running => "running",
            CollectorState::Paused => "paused",
            CollectorState::Stopped => "stopped",
            CollectorState::Error => "error",
        };
        f.write_str(name)
    }
}

impl CollectorState {
    /// Transition for `start`
    pub(crate) fn begin(&mut self, collector: &str) -> Result<()> {
        match self {
            CollectorState::Initialized | CollectorState::Stopped => {
                *self = CollectorState::Running;
                Ok(())
            }
            other => Err(IntegrationError::Lifecycle(format!(
                "Collector {} already running (state: {})", collector, other
            ))),
        }
    }

    /// Check for `stop`; the caller sets the final state once draining is done
    pub(crate) fn ensure_active(&self, collector: &str) -> Result<()> {
        match self {
            CollectorState::Running | CollectorState::Paused => Ok(()),
            other => Err(IntegrationError::Lifecycle(format!(
                "Collector {} not running (state: {})", collector, other
            ))),
        }
    }

    /// Check for event intake
    pub(crate) fn ensure_accepting(&self, collector: &str) -> Result<()> {
        match self {
            CollectorState::Running => Ok(()),
            CollectorState::Paused => Err(IntegrationError::Lifecycle(format!(
                "Collector {} is paused", collector
            ))),
            other => Err(IntegrationError::Lifecycle(format!(
                "Collector {} not running (state: {})", collector, other
            ))),
        }
    }

    pub(crate) fn pause(&mut self, collector: &str) -> Result<()> {
        match self {
            CollectorState::Running => {
                *self = CollectorState::Paused;
                Ok(())
            }
            other => Err(IntegrationError::Lifecycle(format!(
                "Cannot pause collector {} in state {}", collector, other
            ))),
        }
    }

    pub(crate) fn resume(&mut self, collector: &str) -> Result<()> {
        match self {
            CollectorState::Paused => {
                *self = CollectorState::Running;
                Ok(())
            }
            other => Err(IntegrationError::Lifecycle(format!(
                "Cannot resume collector {} in state {}", collector, other
            ))),
        }
    }
}

/// Point-in-time view of a collector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorStatus {
    pub name: String,
    pub state: CollectorState,
    /// Events accepted but not yet published
    pub buffered_events: usize,
    pub events_accepted: u64,
    pub batches_flushed: u64,
    pub events_published: u64,
    pub validation_failures: u64,
    pub publish_failures: u64,
    pub last_flush: Option<DateTime<Utc>>,
}

/// Counters shared between a collector and its background task
#[derive(Debug, Default)]
pub(crate) struct CollectorStats {
    events_accepted: AtomicU64,
    batches_flushed: AtomicU64,
    events_published: AtomicU64,
    validation_failures: AtomicU64,
    publish_failures: AtomicU64,
    /// Unix millis of the last successful flush, 0 if none
    last_flush_ms: AtomicI64,
}

impl CollectorStats {
    pub(crate) fn record_accepted(&self) {
        self.events_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_validation_failures(&self, count: u64) {
        self.validation_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn status(&self, name: &str, state: CollectorState, buffered_events: usize) -> CollectorStatus {
        let last_flush_ms = self.last_flush_ms.load(Ordering::Relaxed);
        CollectorStatus {
            name: name.to_string(),
            state,
            buffered_events,
            events_accepted: self.events_accepted.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            events_published: self.events_published.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            last_flush: if last_flush_ms > 0 {
                Utc.timestamp_millis_opt(last_flush_ms).single()
            } else {
                None
            },
        }
    }
}

/// Publish path shared by both collectors
pub(crate) struct Publisher {
    pub(crate) collector: String,
    pub(crate) producer: Arc<dyn StreamProducer>,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) stats: Arc<CollectorStats>,
    pub(crate) max_attempts: u32,
}

impl Publisher {
    /// Publish one batch with immediate retries.
    ///
    /// The batch is dropped either way; a failure is counted and returned.
    pub(crate) async fn publish(&self, batch: Vec<Vec<u8>>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let size = batch.len();
        let started = Instant::now();
        let policy = RetryPolicy::immediate(self.max_attempts);
        let batch = &batch;

        let result = execute_with_retry(&policy, "publish_batch", None, |_| async move {
            self.producer.publish_batch(batch.clone()).await
        })
        .await;

        self.metrics.observe_duration(names::PUBLISH_LATENCY_MS, started.elapsed()).await;

        match result {
            Ok(()) => {
                self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
                self.stats.events_published.fetch_add(size as u64, Ordering::Relaxed);
                self.stats.last_flush_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                self.metrics.increment_counter(names::BATCHES_FLUSHED, 1).await;
                self.metrics.increment_counter(names::EVENTS_PUBLISHED, size as u64).await;
                self.metrics.observe(names::BATCH_SIZE, size as f64).await;
                debug!("Collector {} published batch of {} events", self.collector, size);
                Ok(())
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                self.metrics.increment_counter(names::PUBLISH_FAILURES, 1).await;
                let error = IntegrationError::dependency(
                    format!("publishing batch of {} events from {}", size, self.collector),
                    e,
                );
                ErrorContext::new("collector", "publish_batch")
                    .with_context("collector", &self.collector)
                    .with_context("batch_size", size)
                    .log(&error);
                Err(error)
            }
        }
    }
}
