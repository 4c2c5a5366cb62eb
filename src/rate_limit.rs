// iSECTECH Security Integrations - Rate Limiting
// Token bucket rate limiter for registry operations
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{IntegrationError, Result};

/// Token bucket state
#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens available
    tokens: f64,
    /// Maximum capacity (burst limit)
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were updated
    last_update: Instant,
}

impl TokenBucket {
    fn new(capacity: usize, refill_rate: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.last_update = now;
        self.tokens = (self.tokens + self.refill_rate * elapsed.as_secs_f64()).min(self.capacity);
    }

    /// Take one token, or report how long until one is available
    fn try_take(&mut self) -> std::result::Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - self.tokens;
            Err(Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX))
        }
    }
}

/// Rate limiter shared by all callers of one component
pub struct RateLimiter {
    name: String,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a limiter allowing `burst` immediate operations refilled at `per_second`
    pub fn new(name: &str, burst: usize, per_second: f64) -> Self {
        Self {
            name: name.to_string(),
            bucket: Mutex::new(TokenBucket::new(burst.max(1), per_second.max(f64::MIN_POSITIVE))),
        }
    }

    /// Take a token without waiting
    pub async fn try_acquire(&self) -> bool {
        self.bucket.lock().await.try_take().is_ok()
    }

    /// Wait for a token for at most `max_wait`.
    ///
    /// Fails immediately with `RateLimited` when the next token cannot arrive
    /// before the deadline.
    pub async fn acquire(&self, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + max_wait;

        loop {
            let wait = match self.bucket.lock().await.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let ready_at = Instant::now().checked_add(wait).filter(|at| *at <= deadline);
            if ready_at.is_none() {
                debug!("Rate limit exceeded for {}", self.name);
                return Err(IntegrationError::RateLimited(format!(
                    "{} rate limit exceeded", self.name
                )));
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// Current token count
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill();
        bucket.tokens
    }
}
