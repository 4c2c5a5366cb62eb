// iSECTECH Security Integrations - Batch Collector
// In-memory buffering with pooled batch validation
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::sync::Arc;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::error::{IntegrationError, Result};
use crate::locks::lock_with_timeout;
use crate::metrics::{names, MetricsCollector};
use crate::streaming::StreamProducer;
use crate::validation::Validator;
use super::{CollectorState, CollectorStats, CollectorStatus, Publisher};

/// Collector that accumulates events and publishes them in validated batches.
///
/// A batch is flushed when the buffer reaches `batch_size` (synchronously,
/// inside `add_event`) or when the flush interval elapses. Invalid events are
/// dropped from the batch and counted; valid ones are published together.
pub struct BatchCollector {
    inner: Arc<BatchInner>,
    /// Intake holds a read guard until its event is buffered or flushed
    state: RwLock<CollectorState>,
    ticker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

struct BatchInner {
    name: String,
    config: CollectorConfig,
    buffer: Mutex<Vec<Value>>,
    validator: Arc<dyn Validator>,
    publisher: Publisher,
    metrics: Arc<MetricsCollector>,
    stats: Arc<CollectorStats>,
}

impl BatchCollector {
    pub fn new(
        name: &str,
        config: CollectorConfig,
        validator: Arc<dyn Validator>,
        producer: Arc<dyn StreamProducer>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let stats = Arc::new(CollectorStats::default());
        let publisher = Publisher {
            collector: name.to_string(),
            producer,
            metrics: Arc::clone(&metrics),
            stats: Arc::clone(&stats),
            max_attempts: config.max_publish_retries,
        };

        Self {
            inner: Arc::new(BatchInner {
                name: name.to_string(),
                buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
                config,
                validator,
                publisher,
                metrics,
                stats,
            }),
            state: RwLock::new(CollectorState::Initialized),
            ticker: Mutex::new(None),
        }
    }

    /// Start the periodic flush task
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.inner.config.validate()?;
        state.begin(&self.inner.name)?;

        let token = CancellationToken::new();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(flush_loop(inner, token.clone()));
        *self.ticker.lock().await = Some((token, handle));

        info!("Batch collector {} started", self.inner.name);
        Ok(())
    }

    /// Stop the flush task and publish whatever is still buffered.
    ///
    /// The collector is stopped even if the final flush fails; the failure is
    /// returned so lost events are not silent.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_active(&self.inner.name)?;

        if let Some((token, handle)) = self.ticker.lock().await.take() {
            token.cancel();
            if let Err(e) = handle.await {
                error!("Flush task of collector {} ended abnormally: {}", self.inner.name, e);
            }
        }

        let result = self.inner.flush().await;
        *state = CollectorState::Stopped;

        info!("Batch collector {} stopped", self.inner.name);
        result
    }

    pub async fn pause(&self) -> Result<()> {
        self.state.write().await.pause(&self.inner.name)
    }

    pub async fn resume(&self) -> Result<()> {
        self.state.write().await.resume(&self.inner.name)
    }

    /// Buffer one event, flushing synchronously when the batch is full
    pub async fn add_event(&self, event: Value) -> Result<()> {
        let state = self.state.read().await;
        state.ensure_accepting(&self.inner.name)?;

        if event.is_null() {
            return Err(IntegrationError::InvalidInput("Event cannot be null".to_string()));
        }

        let mut buffer = lock_with_timeout(
            &self.inner.buffer,
            self.inner.config.lock_timeout(),
            "event buffer",
        )
        .await?;

        buffer.push(event);
        self.inner.stats.record_accepted();
        self.inner.metrics.increment_counter(names::EVENTS_COLLECTED, 1).await;
        self.inner
            .metrics
            .set_gauge(names::BUFFER_OCCUPANCY, buffer.len() as f64 / self.inner.config.batch_size.max(1) as f64)
            .await;

        if buffer.len() >= self.inner.config.batch_size {
            let events = std::mem::take(&mut *buffer);
            return self.inner.flush_events(events).await;
        }

        drop(state);
        Ok(())
    }

    /// Flush the buffer now, regardless of its size
    pub async fn flush(&self) -> Result<()> {
        self.inner.flush().await
    }

    pub async fn status(&self) -> CollectorStatus {
        let state = *self.state.read().await;
        let buffered = self.inner.buffer.lock().await.len();
        self.inner.stats.status(&self.inner.name, state, buffered)
    }
}

impl BatchInner {
    async fn flush(&self) -> Result<()> {
        let mut buffer = lock_with_timeout(&self.buffer, self.config.lock_timeout(), "event buffer").await?;
        if buffer.is_empty() {
            return Ok(());
        }
        let events = std::mem::take(&mut *buffer);
        self.flush_events(events).await
    }

    /// Validate, serialize and publish one batch. Called with the buffer lock held.
    async fn flush_events(&self, events: Vec<Value>) -> Result<()> {
        let total = events.len();
        let valid = self.validate_batch(events).await;
        let rejected = total - valid.len();

        if rejected > 0 {
            self.stats.record_validation_failures(rejected as u64);
            self.metrics.increment_counter(names::VALIDATION_FAILURES, rejected as u64).await;
            warn!("Collector {} dropped {} invalid events out of {}", self.name, rejected, total);
        }

        if valid.is_empty() {
            return Ok(());
        }

        let mut batch = Vec::with_capacity(valid.len());
        for event in &valid {
            batch.push(serde_json::to_vec(event)?);
        }

        self.publisher.publish(batch).await
    }

    /// Validate events on a fixed pool of workers, keeping input order
    async fn validate_batch(&self, events: Vec<Value>) -> Vec<Value> {
        let count = events.len();
        let events = Arc::new(events);

        let (work_tx, work_rx) = mpsc::unbounded_channel::<usize>();
        for index in 0..count {
            let _ = work_tx.send(index);
        }
        drop(work_tx);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, Result<()>)>();
        let workers = self.config.validation_workers.clamp(1, count.max(1));
        let mut handles = Vec::with_capacity(workers);

        for _ in 0..workers {
            let work_rx = Arc::clone(&work_rx);
            let result_tx = result_tx.clone();
            let events = Arc::clone(&events);
            let validator = Arc::clone(&self.validator);

            handles.push(tokio::spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    let Some(index) = next else { break };
                    let outcome = validator.validate_event(&events[index]).await;
                    if result_tx.send((index, outcome)).is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut outcomes: Vec<Option<Result<()>>> = vec![None; count];
        while let Some((index, outcome)) = result_rx.recv().await {
            outcomes[index] = Some(outcome);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!("Validation worker of collector {} failed: {}", self.name, e);
            }
        }

        let events = Arc::try_unwrap(events).unwrap_or_else(|shared| (*shared).clone());
        events
            .into_iter()
            .zip(outcomes)
            .filter_map(|(event, outcome)| match outcome {
                Some(Ok(())) => Some(event),
                Some(Err(e)) => {
                    debug!("Collector {} rejected event: {}", self.name, e);
                    None
                }
                None => None,
            })
            .collect()
    }
}

async fn flush_loop(inner: Arc<BatchInner>, token: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.flush().await {
                    warn!("Periodic flush of collector {} failed: {}", inner.name, e);
                }
            }
        }
    }

    debug!("Flush task of collector {} exiting", inner.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::ErrorKind;
    use crate::test_utils::{eventually, RecordingProducer, ScriptedValidator};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn collector(
        config: CollectorConfig,
        validator: Arc<dyn Validator>,
    ) -> (BatchCollector, Arc<RecordingProducer>, Arc<MetricsCollector>) {
        let producer = Arc::new(RecordingProducer::new());
        let metrics = Arc::new(MetricsCollector::new());
        let collector = BatchCollector::new(
            "okta-batch",
            config,
            validator,
            producer.clone(),
            Arc::clone(&metrics),
        );
        (collector, producer, metrics)
    }

    #[tokio::test]
    async fn test_flush_exactly_at_batch_size() {
        let config = CoreConfig::test_default().collector;
        let (collector, producer, _) = collector(config, Arc::new(ScriptedValidator::accepting()));
        collector.start().await.unwrap();

        collector.add_event(json!({"seq": 1})).await.unwrap();
        collector.add_event(json!({"seq": 2})).await.unwrap();
        assert!(producer.batches().is_empty());
        assert_eq!(collector.status().await.buffered_events, 2);

        collector.add_event(json!({"seq": 3})).await.unwrap();
        assert_eq!(producer.batches().len(), 1);
        assert_eq!(producer.batches()[0].len(), 3);
        assert_eq!(collector.status().await.buffered_events, 0);
    }

    #[tokio::test]
    async fn test_invalid_events_dropped_from_batch() {
        let config = CoreConfig::test_default().collector;
        let (collector, producer, metrics) =
            collector(config, Arc::new(ScriptedValidator::rejecting_field("malicious")));
        collector.start().await.unwrap();

        collector.add_event(json!({"id": 1})).await.unwrap();
        collector.add_event(json!({"id": 2, "malicious": true})).await.unwrap();
        collector.add_event(json!({"id": 3})).await.unwrap();

        let published = producer.events();
        assert_eq!(published, vec![json!({"id": 1}), json!({"id": 3})]);
        assert_eq!(metrics.counter(names::VALIDATION_FAILURES).await, 1);
        assert_eq!(collector.status().await.validation_failures, 1);
    }

    #[tokio::test]
    async fn test_concurrent_adds_flush_without_duplicates() {
        let config = CoreConfig::test_default().collector;
        let batch_size = config.batch_size;
        let (collector, producer, _) = collector(config, Arc::new(ScriptedValidator::accepting()));
        let collector = Arc::new(collector);
        collector.start().await.unwrap();

        let total = batch_size * 3;
        let mut handles = Vec::new();
        for seq in 0..total {
            let collector = Arc::clone(&collector);
            handles.push(tokio::spawn(async move { collector.add_event(json!({"seq": seq})).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(producer.batches().len() >= 3);
        let seqs: Vec<u64> = producer.events().iter().map(|e| e["seq"].as_u64().unwrap()).collect();
        let unique: HashSet<u64> = seqs.iter().copied().collect();
        assert_eq!(seqs.len(), total);
        assert_eq!(unique.len(), total);
    }

    #[tokio::test]
    async fn test_published_bytes_round_trip() {
        let config = CoreConfig::test_default().collector;
        let (collector, producer, _) = collector(config, Arc::new(ScriptedValidator::accepting()));
        collector.start().await.unwrap();

        let submitted = vec![
            json!({"event_type": "user.login", "actor": {"id": "u1"}}),
            json!({"event_type": "user.logout", "tags": ["vpn", "mfa"]}),
            json!({"event_type": "policy.change", "risk": 7.5}),
        ];
        for event in &submitted {
            collector.add_event(event.clone()).await.unwrap();
        }

        assert_eq!(producer.events(), submitted);
    }

    #[tokio::test]
    async fn test_publish_failure_clears_buffer() {
        let config = CoreConfig::test_default().collector;
        let producer = Arc::new(RecordingProducer::failing_first(usize::MAX));
        let collector = BatchCollector::new(
            "okta-batch",
            config,
            Arc::new(ScriptedValidator::accepting()),
            producer.clone(),
            Arc::new(MetricsCollector::new()),
        );
        collector.start().await.unwrap();

        collector.add_event(json!({"seq": 1})).await.unwrap();
        collector.add_event(json!({"seq": 2})).await.unwrap();
        let err = collector.add_event(json!({"seq": 3})).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::DependencyFailure);
        let status = collector.status().await;
        assert_eq!(status.buffered_events, 0);
        assert_eq!(status.publish_failures, 1);
    }

    #[tokio::test]
    async fn test_periodic_flush() {
        let mut config = CoreConfig::test_default().collector;
        config.flush_interval_ms = 20;
        let (collector, producer, _) = collector(config, Arc::new(ScriptedValidator::accepting()));
        collector.start().await.unwrap();

        collector.add_event(json!({"seq": 1})).await.unwrap();

        assert!(eventually(Duration::from_secs(2), || producer.batches().len() == 1).await);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let config = CoreConfig::test_default().collector;
        let (collector, producer, _) = collector(config, Arc::new(ScriptedValidator::accepting()));

        let err = collector.add_event(json!({"seq": 1})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
        assert_eq!(collector.stop().await.unwrap_err().kind(), ErrorKind::Lifecycle);

        collector.start().await.unwrap();
        assert_eq!(collector.start().await.unwrap_err().kind(), ErrorKind::Lifecycle);

        collector.pause().await.unwrap();
        assert_eq!(collector.add_event(json!({"seq": 1})).await.unwrap_err().kind(), ErrorKind::Lifecycle);
        collector.resume().await.unwrap();
        collector.add_event(json!({"seq": 1})).await.unwrap();
        assert_eq!(
            collector.add_event(Value::Null).await.unwrap_err().kind(),
            ErrorKind::InvalidInput
        );

        collector.stop().await.unwrap();
        assert_eq!(producer.events(), vec![json!({"seq": 1})]);
        assert_eq!(collector.status().await.state, CollectorState::Stopped);

        collector.start().await.unwrap();
        collector.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_buffer_lock_timeout() {
        let mut config = CoreConfig::test_default().collector;
        config.lock_timeout_ms = 20;
        let (collector, _, _) = collector(config, Arc::new(ScriptedValidator::accepting()));
        collector.start().await.unwrap();

        let _held = collector.inner.buffer.lock().await;
        let err = collector.add_event(json!({"seq": 1})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_add() {
        let config = CoreConfig::test_default().collector;
        let (collector, producer, _) = collector(config, Arc::new(ScriptedValidator::accepting()));
        let collector = Arc::new(collector);
        collector.start().await.unwrap();

        let held = collector.inner.buffer.lock().await;
        let intake = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.add_event(json!({"seq": 1})).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stopping = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.stop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stopping.is_finished());
        drop(held);

        intake.await.unwrap().unwrap();
        stopping.await.unwrap().unwrap();
        assert_eq!(producer.events(), vec![json!({"seq": 1})]);
        assert_eq!(collector.status().await.buffered_events, 0);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = CoreConfig::test_default().collector;
        config.flush_interval_ms = 0;
        let (collector, _, _) = collector(config, Arc::new(ScriptedValidator::accepting()));

        let err = collector.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(collector.status().await.state, CollectorState::Initialized);
        assert!(collector.ticker.lock().await.is_none());
    }
}
