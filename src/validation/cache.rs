// iSECTECH Security Integrations - Validation Cache
// TTL-keyed cache of validation outcomes
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::time::Duration;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{IntegrationError, Result};

/// Default lifetime of a cached validation outcome
pub const DEFAULT_VALIDATION_TTL: Duration = Duration::from_secs(300);

/// Cached outcome of one validation run
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error: Option<IntegrationError>,
    pub timestamp: Instant,
}

impl ValidationResult {
    /// Reproduce the original outcome
    pub fn to_result(&self) -> Result<()> {
        if self.is_valid {
            return Ok(());
        }
        Err(self.error.clone().unwrap_or_else(|| {
            IntegrationError::ValidationFailed("cached validation failure".to_string())
        }))
    }
}

/// Validation outcomes keyed by event or config identity.
///
/// Entries are usable while `now - timestamp <= ttl`. Expired entries read as
/// misses and are replaced by the next `put`. When `max_entries` is reached,
/// expired entries are purged first and the oldest entry is evicted if the
/// cache is still full.
pub struct ValidationCache {
    entries: DashMap<String, ValidationResult>,
    ttl: Duration,
    max_entries: usize,
}

impl ValidationCache {
    /// Create a cache with the given TTL and size cap
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a usable entry
    pub fn get(&self, key: &str) -> Option<ValidationResult> {
        let entry = self.entries.get(key)?;
        if entry.timestamp.elapsed() <= self.ttl {
            Some(entry.value().clone())
        } else {
            None
        }
    }

    /// Store an outcome, replacing any previous entry for `key`
    pub fn put(&self, key: &str, is_valid: bool, error: Option<IntegrationError>) {
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_entries {
            self.make_room();
        }

        self.entries.insert(
            key.to_string(),
            ValidationResult {
                is_valid,
                error,
                timestamp: Instant::now(),
            },
        );
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, result| result.timestamp.elapsed() <= ttl);
        let purged = before.saturating_sub(self.entries.len());
        if purged > 0 {
            debug!("Purged {} expired validation results", purged);
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }

        let oldest = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().timestamp)
            .map(|entry| entry.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::new(DEFAULT_VALIDATION_TTL, 100_000)
    }
}

/// Build a cache key from a namespace and the canonical bytes of the input
pub fn cache_key(namespace: &str, bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    format!("{}:{:x}", namespace, digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_negative_result_served_until_expiry() {
        let cache = ValidationCache::new(DEFAULT_VALIDATION_TTL, 16);
        let failure = IntegrationError::ValidationFailed("missing field actor".to_string());
        cache.put("event:abc", false, Some(failure.clone()));

        tokio::time::advance(Duration::from_secs(299)).await;
        let cached = cache.get("event:abc").expect("entry should still be live");
        assert_eq!(cached.to_result().unwrap_err(), failure);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("event:abc").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_overwrites_expired_entry() {
        let cache = ValidationCache::new(Duration::from_secs(10), 16);
        cache.put("config:x", false, None);
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(cache.get("config:x").is_none());

        cache.put("config:x", true, None);
        assert!(cache.get("config:x").unwrap().to_result().is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = ValidationCache::new(Duration::from_secs(10), 16);
        cache.put("a", true, None);
        tokio::time::advance(Duration::from_secs(11)).await;
        cache.put("b", true, None);

        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.get("b").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let cache = ValidationCache::new(Duration::from_secs(60), 2);
        cache.put("first", true, None);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.put("second", true, None);
        tokio::time::advance(Duration::from_secs(1)).await;
        cache.put("third", true, None);

        assert_eq!(cache.len(), 2);
        assert!(cache.get("first").is_none());
        assert!(cache.get("third").is_some());
    }

    #[test]
    fn test_cache_key_is_stable() {
        let a = cache_key("event", br#"{"user":"alice"}"#);
        let b = cache_key("event", br#"{"user":"alice"}"#);
        let c = cache_key("config", br#"{"user":"alice"}"#);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("event:"));
    }
}
