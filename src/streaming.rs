// iSECTECH Security Integrations - Streaming Producer
// Persistence sink for collected event batches
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{IntegrationError, Result};

/// Streaming layer that durably stores published batches.
///
/// A successful `publish_batch` transfers ownership of the batch; the
/// collector discards its copy afterwards.
#[async_trait]
pub trait StreamProducer: Send + Sync {
    async fn publish_batch(&self, batch: Vec<Vec<u8>>) -> Result<()>;
}

/// Producer forwarding batches into an in-process channel
pub struct ChannelProducer {
    sender: mpsc::Sender<Vec<Vec<u8>>>,
    send_timeout: Duration,
}

impl ChannelProducer {
    /// Create the producer and the receiving end of its channel
    pub fn new(capacity: usize, send_timeout: Duration) -> (Self, mpsc::Receiver<Vec<Vec<u8>>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender, send_timeout }, receiver)
    }
}

#[async_trait]
impl StreamProducer for ChannelProducer {
    async fn publish_batch(&self, batch: Vec<Vec<u8>>) -> Result<()> {
        match tokio::time::timeout(self.send_timeout, self.sender.send(batch)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(IntegrationError::Unavailable("stream consumer closed".to_string())),
            Err(_) => Err(IntegrationError::Timeout(format!(
                "stream consumer did not accept batch within {:?}", self.send_timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_producer_delivers() {
        let (producer, mut receiver) = ChannelProducer::new(4, Duration::from_millis(50));
        producer.publish_batch(vec![b"{\"a\":1}".to_vec()]).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap(), vec![b"{\"a\":1}".to_vec()]);
    }

    #[tokio::test]
    async fn test_channel_producer_full_times_out() {
        let (producer, _receiver) = ChannelProducer::new(1, Duration::from_millis(20));
        producer.publish_batch(vec![b"1".to_vec()]).await.unwrap();
        let err = producer.publish_batch(vec![b"2".to_vec()]).await.unwrap_err();
        assert!(matches!(err, IntegrationError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_channel_producer_closed() {
        let (producer, receiver) = ChannelProducer::new(1, Duration::from_millis(20));
        drop(receiver);
        let err = producer.publish_batch(vec![b"1".to_vec()]).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
