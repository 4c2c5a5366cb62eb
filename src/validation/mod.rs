// iSECTECH Security Integrations - Validation
// Event and configuration validation entry points
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Validation of collected events and integration configurations.
//!
//! The core treats validation as an opaque pass/fail collaborator behind the
//! [`Validator`] trait. [`CachedValidator`] puts the shared
//! [`ValidationCache`] in front of any validator so unchanged inputs are not
//! re-checked, and the structure helpers here give the realtime collector its
//! size and depth checks.

use std::sync::Arc;
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::IntegrationConfig;
use crate::error::{IntegrationError, Result};
use crate::metrics::{names, MetricsCollector};

pub mod cache;
pub mod schema;

pub use cache::{cache_key, ValidationCache, ValidationResult};
pub use schema::SchemaValidator;

/// Schema, security and compliance checks
#[async_trait]
pub trait Validator: Send + Sync {
    /// Validate one collected event
    async fn validate_event(&self, event: &Value) -> Result<()>;

    /// Validate an integration configuration
    async fn validate_config(&self, config: &IntegrationConfig) -> Result<()>;
}

/// Validator backed by the shared validation cache.
///
/// Outcomes that are valid, or invalid for a non-retryable reason, are cached.
/// Transient failures (timeouts, unavailable dependencies) are returned but
/// never cached.
pub struct CachedValidator {
    inner: Arc<dyn Validator>,
    cache: Arc<ValidationCache>,
    metrics: Arc<MetricsCollector>,
}

impl CachedValidator {
    pub fn new(
        inner: Arc<dyn Validator>,
        cache: Arc<ValidationCache>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self { inner, cache, metrics }
    }

    /// The cache shared with other entry points
    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }

    async fn lookup(&self, key: &str) -> Option<Result<()>> {
        match self.cache.get(key) {
            Some(cached) => {
                self.metrics.increment_counter(names::VALIDATION_CACHE_HITS, 1).await;
                Some(cached.to_result())
            }
            None => {
                self.metrics.increment_counter(names::VALIDATION_CACHE_MISSES, 1).await;
                None
            }
        }
    }

    fn store(&self, key: &str, outcome: &Result<()>) {
        match outcome {
            Ok(()) => self.cache.put(key, true, None),
            Err(e) if !e.is_retryable() => self.cache.put(key, false, Some(e.clone())),
            Err(e) => debug!("Not caching transient validation failure for {}: {}", key, e),
        }
    }
}

#[async_trait]
impl Validator for CachedValidator {
    async fn validate_event(&self, event: &Value) -> Result<()> {
        let key = cache_key("event", &serde_json::to_vec(event)?);
        if let Some(outcome) = self.lookup(&key).await {
            return outcome;
        }

        let outcome = self.inner.validate_event(event).await;
        self.store(&key, &outcome);
        outcome
    }

    async fn validate_config(&self, config: &IntegrationConfig) -> Result<()> {
        // Round-trip through Value so map fields serialize in sorted order
        let canonical = serde_json::to_value(config)?;
        let key = cache_key("config", &serde_json::to_vec(&canonical)?);
        if let Some(outcome) = self.lookup(&key).await {
            return outcome;
        }

        let outcome = self.inner.validate_config(config).await;
        self.store(&key, &outcome);
        outcome
    }
}

/// Reject empty payloads and payloads not strictly below `max_size`
pub fn validate_event_size(data: &[u8], max_size: usize) -> Result<()> {
    if data.is_empty() {
        return Err(IntegrationError::InvalidInput("Event payload is empty".to_string()));
    }

    if data.len() >= max_size {
        return Err(IntegrationError::InvalidInput(format!(
            "Event payload of {} bytes is not below the limit of {} bytes", data.len(), max_size
        )));
    }

    Ok(())
}

/// Parse a payload as strict JSON and enforce a nesting limit
pub fn validate_json_structure(data: &[u8], max_depth: usize) -> Result<Value> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| IntegrationError::ValidationFailed(format!("Malformed JSON event: {}", e)))?;

    let depth = json_depth(&value);
    if depth > max_depth {
        return Err(IntegrationError::ValidationFailed(format!(
            "Event nesting depth {} exceeds maximum of {}", depth, max_depth
        )));
    }

    Ok(value)
}

/// Nesting depth of a JSON value, scalars count as depth 1
pub fn json_depth(value: &Value) -> usize {
    let mut max_depth = 0;
    let mut stack = vec![(value, 1usize)];

    while let Some((current, depth)) = stack.pop() {
        max_depth = max_depth.max(depth);
        match current {
            Value::Array(items) => stack.extend(items.iter().map(|v| (v, depth + 1))),
            Value::Object(map) => stack.extend(map.values().map(|v| (v, depth + 1))),
            _ => {}
        }
    }

    max_depth
}
