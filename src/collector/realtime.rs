// iSECTECH Security Integrations - Realtime Collector
// Per-event validation with bounded-channel backpressure
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CollectorConfig;
use crate::error::{IntegrationError, Result};
use crate::metrics::{names, MetricsCollector};
use crate::streaming::StreamProducer;
use crate::validation::{validate_event_size, validate_json_structure, Validator};
use super::{CollectorState, CollectorStats, CollectorStatus, Publisher};

/// Collector that validates each event as it arrives.
///
/// Accepted events go into a bounded channel of `buffer_size`. When the
/// channel is full, `collect_event` waits up to the collection timeout for
/// room, then fails with a timeout. A drain task batches events from the
/// channel and publishes on batch size or on the flush interval.
pub struct RealtimeCollector {
    name: String,
    config: CollectorConfig,
    /// Intake holds a read guard until its event is enqueued
    state: RwLock<CollectorState>,
    sender: mpsc::Sender<Vec<u8>>,
    /// Receiver, parked here while no drain task owns it
    receiver: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    drain: Mutex<Option<(CancellationToken, JoinHandle<mpsc::Receiver<Vec<u8>>>)>>,
    validator: Arc<dyn Validator>,
    publisher: Arc<Publisher>,
    metrics: Arc<MetricsCollector>,
    stats: Arc<CollectorStats>,
}

impl RealtimeCollector {
    pub fn new(
        name: &str,
        config: CollectorConfig,
        validator: Arc<dyn Validator>,
        producer: Arc<dyn StreamProducer>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.buffer_size.max(1));
        let stats = Arc::new(CollectorStats::default());
        let publisher = Arc::new(Publisher {
            collector: name.to_string(),
            producer,
            metrics: Arc::clone(&metrics),
            stats: Arc::clone(&stats),
            max_attempts: config.max_publish_retries,
        });

        Self {
            name: name.to_string(),
            config,
            state: RwLock::new(CollectorState::Initialized),
            sender,
            receiver: Mutex::new(Some(receiver)),
            drain: Mutex::new(None),
            validator,
            publisher,
            metrics,
            stats,
        }
    }

    /// Start the drain task
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.config.validate()?;
        state.begin(&self.name)?;

        let Some(receiver) = self.receiver.lock().await.take() else {
            *state = CollectorState::Error;
            return Err(IntegrationError::Internal(format!(
                "Event channel of collector {} is gone", self.name
            )));
        };

        let token = CancellationToken::new();
        let handle = tokio::spawn(drain_loop(
            Arc::clone(&self.publisher),
            receiver,
            token.clone(),
            self.config.batch_size.max(1),
            self.config.flush_interval(),
        ));
        *self.drain.lock().await = Some((token, handle));

        info!("Realtime collector {} started", self.name);
        Ok(())
    }

    /// Stop the drain task after it publishes everything already buffered
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_active(&self.name)?;

        let Some((token, handle)) = self.drain.lock().await.take() else {
            *state = CollectorState::Error;
            return Err(IntegrationError::Internal(format!(
                "Collector {} has no drain task", self.name
            )));
        };

        token.cancel();
        match handle.await {
            Ok(receiver) => {
                *self.receiver.lock().await = Some(receiver);
                *state = CollectorState::Stopped;
                info!("Realtime collector {} stopped", self.name);
                Ok(())
            }
            Err(e) => {
                *state = CollectorState::Error;
                error!("Drain task of collector {} ended abnormally: {}", self.name, e);
                Err(IntegrationError::Internal(format!(
                    "Drain task of collector {} failed: {}", self.name, e
                )))
            }
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.state.write().await.pause(&self.name)
    }

    pub async fn resume(&self) -> Result<()> {
        self.state.write().await.resume(&self.name)
    }

    /// Validate one raw event and enqueue it.
    ///
    /// Blocks up to the collection timeout while the buffer is full and
    /// returns early if `cancel` fires.
    pub async fn collect_event(&self, cancel: &CancellationToken, data: Vec<u8>) -> Result<()> {
        let started = Instant::now();

        if cancel.is_cancelled() {
            return Err(IntegrationError::Cancelled("Event collection cancelled".to_string()));
        }

        validate_event_size(&data, self.config.max_event_size_bytes)?;
        let event = validate_json_structure(&data, self.config.max_json_depth)?;

        let state = self.state.read().await;
        state.ensure_accepting(&self.name)?;

        if let Err(e) = self.validator.validate_event(&event).await {
            self.stats.record_validation_failures(1);
            self.metrics.increment_counter(names::VALIDATION_FAILURES, 1).await;
            return Err(e);
        }

        match self.sender.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => {
                debug!("Collector {} buffer full, waiting for room", self.name);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(IntegrationError::Cancelled(
                            "Event collection cancelled while buffer full".to_string(),
                        ));
                    }
                    sent = tokio::time::timeout(self.config.collection_timeout(), self.sender.send(data)) => {
                        match sent {
                            Ok(Ok(())) => {}
                            Ok(Err(_)) => return Err(self.channel_closed()),
                            Err(_) => {
                                self.metrics.increment_counter(names::BUFFER_FULL, 1).await;
                                return Err(IntegrationError::Timeout(format!(
                                    "Event buffer of collector {} full for {:?}",
                                    self.name,
                                    self.config.collection_timeout()
                                )));
                            }
                        }
                    }
                }
            }
            Err(TrySendError::Closed(_)) => return Err(self.channel_closed()),
        }

        self.stats.record_accepted();
        self.metrics.increment_counter(names::EVENTS_COLLECTED, 1).await;
        self.metrics.observe_duration(names::COLLECTION_LATENCY_MS, started.elapsed()).await;
        self.metrics
            .set_gauge(names::BUFFER_OCCUPANCY, self.buffered() as f64 / self.sender.max_capacity() as f64)
            .await;
        drop(state);
        Ok(())
    }

    pub async fn status(&self) -> CollectorStatus {
        let state = *self.state.read().await;
        self.stats.status(&self.name, state, self.buffered())
    }

    fn buffered(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn channel_closed(&self) -> IntegrationError {
        IntegrationError::Internal(format!("Event channel of collector {} closed", self.name))
    }
}

/// Owns the receiver while running and hands it back on exit
async fn drain_loop(
    publisher: Arc<Publisher>,
    mut receiver: mpsc::Receiver<Vec<u8>>,
    token: CancellationToken,
    batch_size: usize,
    flush_interval: std::time::Duration,
) -> mpsc::Receiver<Vec<u8>> {
    let mut batch: Vec<Vec<u8>> = Vec::with_capacity(batch_size);
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = receiver.recv() => match received {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        flush(&publisher, &mut batch).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(&publisher, &mut batch).await,
        }
    }

    while let Ok(event) = receiver.try_recv() {
        batch.push(event);
        if batch.len() >= batch_size {
            flush(&publisher, &mut batch).await;
        }
    }
    flush(&publisher, &mut batch).await;

    debug!("Drain task of collector {} exiting", publisher.collector);
    receiver
}

async fn flush(publisher: &Publisher, batch: &mut Vec<Vec<u8>>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    if let Err(e) = publisher.publish(events).await {
        warn!("Flush of collector {} failed: {}", publisher.collector, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::error::ErrorKind;
    use crate::test_utils::{eventually, BlockingProducer, RecordingProducer, ScriptedValidator};
    use serde_json::json;
    use std::time::Duration;

    fn collector_with(
        config: CollectorConfig,
        producer: Arc<dyn StreamProducer>,
    ) -> (RealtimeCollector, Arc<MetricsCollector>) {
        let metrics = Arc::new(MetricsCollector::new());
        let collector = RealtimeCollector::new(
            "okta-realtime",
            config,
            Arc::new(ScriptedValidator::rejecting_field("malicious")),
            producer,
            Arc::clone(&metrics),
        );
        (collector, metrics)
    }

    fn event(seq: u64) -> Vec<u8> {
        serde_json::to_vec(&json!({"seq": seq})).unwrap()
    }

    #[tokio::test]
    async fn test_flush_on_batch_size() {
        let producer = Arc::new(RecordingProducer::new());
        let (collector, _) = collector_with(CoreConfig::test_default().collector, producer.clone());
        collector.start().await.unwrap();
        let cancel = CancellationToken::new();

        for seq in 0..3 {
            collector.collect_event(&cancel, event(seq)).await.unwrap();
        }

        assert!(eventually(Duration::from_secs(2), || producer.batches().len() == 1).await);
        assert_eq!(producer.events(), vec![json!({"seq": 0}), json!({"seq": 1}), json!({"seq": 2})]);
    }

    #[tokio::test]
    async fn test_flush_on_interval() {
        let mut config = CoreConfig::test_default().collector;
        config.flush_interval_ms = 20;
        let producer = Arc::new(RecordingProducer::new());
        let (collector, _) = collector_with(config, producer.clone());
        collector.start().await.unwrap();

        collector.collect_event(&CancellationToken::new(), event(7)).await.unwrap();

        assert!(eventually(Duration::from_secs(2), || producer.events() == vec![json!({"seq": 7})]).await);
    }

    #[tokio::test]
    async fn test_stop_flushes_partial_batch() {
        let producer = Arc::new(RecordingProducer::new());
        let (collector, _) = collector_with(CoreConfig::test_default().collector, producer.clone());
        collector.start().await.unwrap();
        let cancel = CancellationToken::new();

        collector.collect_event(&cancel, event(1)).await.unwrap();
        collector.collect_event(&cancel, event(2)).await.unwrap();
        collector.stop().await.unwrap();

        assert_eq!(producer.events(), vec![json!({"seq": 1}), json!({"seq": 2})]);
        let status = collector.status().await;
        assert_eq!(status.state, CollectorState::Stopped);
        assert_eq!(status.buffered_events, 0);
        assert_eq!(status.events_published, 2);

        collector.start().await.unwrap();
        collector.collect_event(&cancel, event(3)).await.unwrap();
        collector.stop().await.unwrap();
        assert_eq!(producer.events().len(), 3);
    }

    #[tokio::test]
    async fn test_full_buffer_times_out() {
        let mut config = CoreConfig::test_default().collector;
        config.buffer_size = 1;
        config.batch_size = 1;
        let (collector, metrics) = collector_with(config, Arc::new(BlockingProducer));
        collector.start().await.unwrap();
        let cancel = CancellationToken::new();

        // First event parks the drain task inside a publish that never returns
        collector.collect_event(&cancel, event(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.collect_event(&cancel, event(2)).await.unwrap();

        let err = collector.collect_event(&cancel, event(3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(metrics.counter(names::BUFFER_FULL).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_while_buffer_full() {
        let mut config = CoreConfig::test_default().collector;
        config.buffer_size = 1;
        config.batch_size = 1;
        config.collection_timeout_ms = 10_000;
        let (collector, _) = collector_with(config, Arc::new(BlockingProducer));
        collector.start().await.unwrap();
        let cancel = CancellationToken::new();

        collector.collect_event(&cancel, event(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.collect_event(&cancel, event(2)).await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let err = collector.collect_event(&cancel, event(3)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_rejects_bad_payloads() {
        let producer = Arc::new(RecordingProducer::new());
        let (collector, metrics) = collector_with(CoreConfig::test_default().collector, producer.clone());
        collector.start().await.unwrap();
        let cancel = CancellationToken::new();

        let empty = collector.collect_event(&cancel, Vec::new()).await.unwrap_err();
        assert_eq!(empty.kind(), ErrorKind::InvalidInput);

        let malformed = collector.collect_event(&cancel, b"{\"seq\":".to_vec()).await.unwrap_err();
        assert_eq!(malformed.kind(), ErrorKind::ValidationFailed);

        let rejected = collector
            .collect_event(&cancel, serde_json::to_vec(&json!({"malicious": 1})).unwrap())
            .await
            .unwrap_err();
        assert_eq!(rejected.kind(), ErrorKind::ValidationFailed);
        assert_eq!(metrics.counter(names::VALIDATION_FAILURES).await, 1);

        collector.stop().await.unwrap();
        assert!(producer.events().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let producer = Arc::new(RecordingProducer::new());
        let (collector, _) = collector_with(CoreConfig::test_default().collector, producer.clone());
        let cancel = CancellationToken::new();

        let err = collector.collect_event(&cancel, event(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lifecycle);

        collector.start().await.unwrap();
        assert_eq!(collector.start().await.unwrap_err().kind(), ErrorKind::Lifecycle);

        collector.pause().await.unwrap();
        assert_eq!(collector.collect_event(&cancel, event(1)).await.unwrap_err().kind(), ErrorKind::Lifecycle);
        collector.resume().await.unwrap();
        collector.collect_event(&cancel, event(1)).await.unwrap();

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert_eq!(
            collector.collect_event(&cancelled, event(2)).await.unwrap_err().kind(),
            ErrorKind::Cancelled
        );

        collector.stop().await.unwrap();
        assert_eq!(collector.stop().await.unwrap_err().kind(), ErrorKind::Lifecycle);
        assert_eq!(producer.events(), vec![json!({"seq": 1})]);
    }

    #[tokio::test]
    async fn test_stop_waits_for_in_flight_event() {
        let producer = Arc::new(RecordingProducer::new());
        let collector = Arc::new(RealtimeCollector::new(
            "okta-realtime",
            CoreConfig::test_default().collector,
            Arc::new(ScriptedValidator::accepting().with_delay(Duration::from_millis(100))),
            producer.clone(),
            Arc::new(MetricsCollector::new()),
        ));
        collector.start().await.unwrap();

        let intake = {
            let collector = Arc::clone(&collector);
            tokio::spawn(async move { collector.collect_event(&CancellationToken::new(), event(1)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        collector.stop().await.unwrap();

        intake.await.unwrap().unwrap();
        assert_eq!(producer.events(), vec![json!({"seq": 1})]);
        let status = collector.status().await;
        assert_eq!(status.state, CollectorState::Stopped);
        assert_eq!(status.buffered_events, 0);
        assert_eq!(status.events_published, 1);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = CoreConfig::test_default().collector;
        config.flush_interval_ms = 0;
        let (collector, _) = collector_with(config, Arc::new(RecordingProducer::new()));

        let err = collector.start().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(collector.status().await.state, CollectorState::Initialized);
        assert!(collector.receiver.lock().await.is_some());
    }
}
