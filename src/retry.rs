// iSECTECH Security Integrations - Retry Management
// Bounded retry with per-policy backoff and error classification
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{IntegrationError, Result};

/// Delay strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry right away
    Immediate,
    /// Sleep `attempt * base` after the n-th failed attempt
    Linear(Duration),
}

/// Retry configuration for one kind of operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Delay strategy
    pub backoff: Backoff,
    /// Whether to retry on this error
    pub retry_on_error: fn(&IntegrationError) -> bool,
}

impl RetryPolicy {
    /// Immediate retries on any error (collector publish path)
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Immediate,
            retry_on_error: |_| true,
        }
    }

    /// Linear backoff retrying only retryable error kinds (deployment path)
    pub fn linear(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Linear(base),
            retry_on_error: IntegrationError::is_retryable,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Linear(base) => base * attempt,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// `operation` receives the 1-based attempt number. A cancelled `cancel`
/// token stops further attempts; the last error is returned.
pub async fn execute_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;

    loop {
        let error = match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(error) => error,
        };

        if !(policy.retry_on_error)(&error) {
            debug!("{} failed permanently: {}", operation_name, error);
            return Err(error);
        }

        if attempt >= policy.max_attempts {
            warn!("{} exhausted all {} attempts: {}", operation_name, policy.max_attempts, error);
            return Err(error);
        }

        let delay = policy.delay_after(attempt);
        debug!(
            "{} failed (attempt {}/{}), retrying in {:?}: {}",
            operation_name, attempt, policy.max_attempts, delay, error
        );

        match cancel {
            Some(token) if token.is_cancelled() => return Err(error),
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(error),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None if delay > Duration::ZERO => tokio::time::sleep(delay).await,
            None => {}
        }

        attempt += 1;
    }
}
