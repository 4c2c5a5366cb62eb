// iSECTECH Security Integrations - Platform Registry
// Platform type to factory mapping with instance caching
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Registry of platform adapters.
//!
//! Maps a platform type tag to the [`PlatformFactory`] that builds it and
//! caches constructed instances for a TTL, since construction may involve
//! network calls and credential exchange. Expired cache entries are never
//! returned and are replaced lazily on the next lookup for the same type.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::error::{IntegrationError, Result};
use crate::locks::{read_with_timeout, write_with_timeout};
use crate::platform::{Platform, PlatformFactory};
use crate::rate_limit::RateLimiter;

/// Cached platform instance
#[derive(Clone)]
pub struct PlatformCacheEntry {
    pub platform: Arc<dyn Platform>,
    pub expires_at: Instant,
}

impl PlatformCacheEntry {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// Roughly 30 years; stands in for "never" when a TTL would overflow `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Expiry instant for an entry cached now, saturating for oversized TTLs
fn expiry_after(ttl: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(ttl)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Platform registry shared by the manager and deployer
pub struct PlatformRegistry {
    /// Registered factories by platform type
    factories: RwLock<HashMap<String, PlatformFactory>>,
    /// Constructed instances by platform type
    cache: RwLock<HashMap<String, PlatformCacheEntry>>,
    /// Gate for registry mutations and cache misses
    rate_limiter: RateLimiter,
    config: RegistryConfig,
}

impl PlatformRegistry {
    /// Create an empty registry
    pub fn new(config: RegistryConfig) -> Self {
        let rate_limiter = RateLimiter::new(
            "platform registry",
            config.rate_limit_burst,
            config.rate_limit_per_sec,
        );

        Self {
            factories: RwLock::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
            rate_limiter,
            config,
        }
    }

    /// Register a factory for `platform_type`.
    ///
    /// The factory is invoked once as a probe; registration fails if it errors
    /// or produces no platform. Existing registrations are never overwritten.
    pub async fn register_platform(&self, platform_type: &str, factory: PlatformFactory) -> Result<()> {
        if platform_type.trim().is_empty() {
            return Err(IntegrationError::InvalidInput("Platform type cannot be empty".to_string()));
        }

        self.rate_limiter.acquire(self.config.lock_timeout()).await?;

        if self.is_registered(platform_type).await? {
            return Err(already_registered(platform_type));
        }

        // Probe outside the lock, construction may be slow
        match factory() {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(IntegrationError::InvalidInput(format!(
                    "Factory for platform {} returned no platform", platform_type
                )));
            }
            Err(e) => {
                return Err(IntegrationError::dependency(
                    format!("probing factory for platform {}", platform_type),
                    e,
                ));
            }
        }

        let mut factories = write_with_timeout(&self.factories, self.config.lock_timeout(), "registry").await?;
        if factories.contains_key(platform_type) {
            return Err(already_registered(platform_type));
        }
        factories.insert(platform_type.to_string(), factory);
        drop(factories);

        info!("Registered platform type: {}", platform_type);
        Ok(())
    }

    /// Get a platform instance, constructing and caching it on a miss
    pub async fn get_platform(&self, platform_type: &str) -> Result<Arc<dyn Platform>> {
        {
            let cache = read_with_timeout(&self.cache, self.config.lock_timeout(), "platform cache").await?;
            if let Some(entry) = cache.get(platform_type) {
                if entry.is_live() {
                    debug!("Platform cache hit for {}", platform_type);
                    return Ok(Arc::clone(&entry.platform));
                }
            }
        }

        self.rate_limiter.acquire(self.config.lock_timeout()).await?;

        let factory = {
            let factories = read_with_timeout(&self.factories, self.config.lock_timeout(), "registry").await?;
            factories.get(platform_type).cloned()
        }
        .ok_or_else(|| {
            IntegrationError::NotFound(format!("Platform type not registered: {}", platform_type))
        })?;

        let platform = match factory() {
            Ok(Some(platform)) => platform,
            Ok(None) => {
                return Err(IntegrationError::dependency(
                    format!("constructing platform {}", platform_type),
                    IntegrationError::Internal("factory returned no platform".to_string()),
                ));
            }
            Err(e) => {
                return Err(IntegrationError::dependency(
                    format!("constructing platform {}", platform_type),
                    e,
                ));
            }
        };

        let mut cache = write_with_timeout(&self.cache, self.config.lock_timeout(), "platform cache").await?;
        cache.insert(
            platform_type.to_string(),
            PlatformCacheEntry {
                platform: Arc::clone(&platform),
                expires_at: expiry_after(self.config.cache_ttl()),
            },
        );

        debug!("Constructed and cached platform {}", platform_type);
        Ok(platform)
    }

    /// Registered platform types, sorted.
    ///
    /// Best effort: returns an empty list when the registry lock is unavailable.
    pub async fn list_platforms(&self) -> Vec<String> {
        match read_with_timeout(&self.factories, self.config.lock_timeout(), "registry").await {
            Ok(factories) => {
                let mut types: Vec<String> = factories.keys().cloned().collect();
                types.sort();
                types
            }
            Err(e) => {
                warn!("Listing platforms failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Whether a factory is registered for `platform_type`
    pub async fn is_registered(&self, platform_type: &str) -> Result<bool> {
        let factories = read_with_timeout(&self.factories, self.config.lock_timeout(), "registry").await?;
        Ok(factories.contains_key(platform_type))
    }

    /// Remove a platform type and its cached instance
    pub async fn unregister_platform(&self, platform_type: &str) -> Result<()> {
        self.rate_limiter.acquire(self.config.lock_timeout()).await?;

        let removed = write_with_timeout(&self.factories, self.config.lock_timeout(), "registry")
            .await?
            .remove(platform_type);

        if removed.is_none() {
            return Err(IntegrationError::NotFound(format!(
                "Platform type not registered: {}", platform_type
            )));
        }

        self.invalidate_cache(platform_type).await?;
        info!("Unregistered platform type: {}", platform_type);
        Ok(())
    }

    /// Drop the cached instance for `platform_type`, if any
    pub async fn invalidate_cache(&self, platform_type: &str) -> Result<()> {
        write_with_timeout(&self.cache, self.config.lock_timeout(), "platform cache")
            .await?
            .remove(platform_type);
        Ok(())
    }
}

fn already_registered(platform_type: &str) -> IntegrationError {
    IntegrationError::AlreadyExists(format!("Platform type already registered: {}", platform_type))
}
