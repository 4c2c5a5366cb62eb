// iSECTECH Security Integrations Core Library
// Integration orchestration and event collection for third-party security platforms
// Copyright (c) 2024 iSECTECH. All rights reserved.

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

//! # iSECTECH Integration Core
//!
//! Control plane and data plane for connecting third-party security platforms
//! (identity providers, cloud platforms, EDR tools) to the iSECTECH pipeline.
//!
//! ## Architecture
//!
//! - **Registry**: platform type tag to factory mapping, with a TTL cache of
//!   constructed adapters
//! - **Manager**: validate, initialize, start, stop and query integrations
//! - **Deployer**: concurrency cap, retry with linear backoff, deadline and
//!   monitoring around the manager
//! - **Collectors**: batch and realtime buffering, validation and publication
//!   of events to the streaming layer
//! - **Validation**: pluggable validator fronted by a shared result cache
//!
//! Components are constructed explicitly through [`RuntimeBuilder`]; nothing
//! is a process-wide singleton.

use std::sync::Arc;

pub mod collector;
pub mod config;
pub mod deployer;
pub mod error;
pub mod locks;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod platform;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod streaming;
pub mod validation;

pub use collector::{BatchCollector, CollectorState, CollectorStatus, RealtimeCollector};
pub use config::{CollectionMode, CoreConfig, IntegrationConfig};
pub use deployer::{Deployer, DeploymentState, DeploymentStatus};
pub use error::{ErrorKind, IntegrationError, Result};
pub use manager::{IntegrationInfo, IntegrationManager, IntegrationState, IntegrationStatus};
pub use metrics::MetricsCollector;
pub use platform::{Platform, PlatformFactory, PlatformState, PlatformStatus};
pub use registry::PlatformRegistry;
pub use streaming::StreamProducer;
pub use validation::{CachedValidator, SchemaValidator, ValidationCache, Validator};

/// Library version information
pub mod version {
    /// Library version string
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");

    /// Build timestamp
    pub const BUILD_DATE: &str = env!("BUILD_DATE");

    /// Git commit hash
    pub const GIT_COMMIT: &str = env!("GIT_COMMIT");

    /// Git branch
    pub const GIT_BRANCH: &str = env!("GIT_BRANCH");

    /// Build profile
    pub const BUILD_PROFILE: &str = env!("BUILD_PROFILE");
}

/// Fully wired set of integration components sharing one configuration,
/// metrics collector and validation cache.
pub struct IntegrationRuntime {
    config: CoreConfig,
    metrics: Arc<MetricsCollector>,
    validation_cache: Arc<ValidationCache>,
    validator: Arc<CachedValidator>,
    registry: Arc<PlatformRegistry>,
    manager: Arc<IntegrationManager>,
    deployer: Arc<Deployer>,
}

impl IntegrationRuntime {
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn validation_cache(&self) -> &Arc<ValidationCache> {
        &self.validation_cache
    }

    /// Cached validator shared by the manager and every collector
    pub fn validator(&self) -> Arc<dyn Validator> {
        self.validator.clone()
    }

    pub fn registry(&self) -> &Arc<PlatformRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<IntegrationManager> {
        &self.manager
    }

    pub fn deployer(&self) -> &Arc<Deployer> {
        &self.deployer
    }

    /// New batch collector publishing to `producer`
    pub fn batch_collector(&self, name: &str, producer: Arc<dyn StreamProducer>) -> BatchCollector {
        BatchCollector::new(
            name,
            self.config.collector.clone(),
            self.validator(),
            producer,
            Arc::clone(&self.metrics),
        )
    }

    /// New realtime collector publishing to `producer`
    pub fn realtime_collector(&self, name: &str, producer: Arc<dyn StreamProducer>) -> RealtimeCollector {
        RealtimeCollector::new(
            name,
            self.config.collector.clone(),
            self.validator(),
            producer,
            Arc::clone(&self.metrics),
        )
    }

    /// Refuse new deployments and stop every deployed integration.
    ///
    /// Integrations that fail to stop stay deployed; the first failure is returned.
    pub async fn shutdown(&self) -> Result<()> {
        self.deployer.shutdown();

        let mut first_error = None;
        for integration in self.manager.list_integrations().await? {
            if let Err(e) = self.manager.stop_integration(&integration.id).await {
                tracing::warn!("Failed to stop integration {} during shutdown: {}", integration.id, e);
                first_error.get_or_insert(e);
            }
        }

        let purged = self.validation_cache.purge_expired();
        tracing::info!("Integration runtime shut down ({} expired validations purged)", purged);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Builder for [`IntegrationRuntime`]
pub struct RuntimeBuilder {
    config: Option<CoreConfig>,
    validator: Option<Arc<dyn Validator>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            validator: None,
            metrics: None,
        }
    }

    pub fn with_config(mut self, config: CoreConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use an external validator instead of [`SchemaValidator`]; it is still
    /// fronted by the validation cache
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Result<IntegrationRuntime> {
        let config = self.config.ok_or_else(|| {
            IntegrationError::Configuration("Configuration is required".to_string())
        })?;
        config.validate()?;

        let metrics = self.metrics.unwrap_or_else(|| Arc::new(MetricsCollector::new()));
        let inner: Arc<dyn Validator> = match self.validator {
            Some(validator) => validator,
            None => Arc::new(SchemaValidator::new(
                config.validation.clone(),
                config.collector.max_event_size_bytes,
                config.collector.max_json_depth,
            )),
        };

        let validation_cache = Arc::new(ValidationCache::new(
            config.validation.cache_ttl(),
            config.validation.max_cache_entries,
        ));
        let validator = Arc::new(CachedValidator::new(
            inner,
            Arc::clone(&validation_cache),
            Arc::clone(&metrics),
        ));

        let registry = Arc::new(PlatformRegistry::new(config.registry.clone()));
        let manager = Arc::new(IntegrationManager::new(
            Arc::clone(&registry),
            validator.clone(),
            Arc::clone(&metrics),
            config.registry.lock_timeout(),
        ));
        let deployer = Arc::new(Deployer::new(
            Arc::clone(&manager),
            Arc::clone(&registry),
            Arc::clone(&metrics),
            config.deployer.clone(),
        ));

        tracing::info!("Integration runtime {} ({}) ready", version::VERSION, version::GIT_COMMIT);

        Ok(IntegrationRuntime {
            config,
            metrics,
            validation_cache,
            validator,
            registry,
            manager,
            deployer,
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::names;
    use crate::test_utils::{RecordingProducer, StubPlatform};
    use serde_json::json;

    fn runtime() -> IntegrationRuntime {
        RuntimeBuilder::new()
            .with_config(CoreConfig::test_default())
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_config() {
        let err = RuntimeBuilder::new().build().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_demo_deploy_list_stop() {
        let runtime = runtime();
        let platform = Arc::new(StubPlatform::new("demo"));
        runtime
            .registry()
            .register_platform("demo", StubPlatform::shared_factory(Arc::clone(&platform)))
            .await
            .unwrap();

        let deployment = runtime
            .deployer()
            .deploy(IntegrationConfig::new("demo", "demo-integration"))
            .await
            .unwrap();
        let integration_id = deployment.integration_id.unwrap();

        let listed = runtime.manager().list_integrations().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, integration_id);
        assert_eq!(listed[0].config.platform_type, "demo");
        assert_eq!(listed[0].config.name, "demo-integration");

        runtime.manager().stop_integration(&integration_id).await.unwrap();
        assert!(runtime.manager().list_integrations().await.unwrap().is_empty());
        assert_eq!(platform.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_collectors_share_validation_cache() {
        let runtime = runtime();
        let producer = Arc::new(RecordingProducer::new());
        let batch = runtime.batch_collector("okta-batch", producer.clone());
        batch.start().await.unwrap();

        batch.add_event(json!({"event_type": "login", "user": "alice"})).await.unwrap();
        batch.add_event(json!({"event_type": "login", "note": "<script>alert(1)</script>"})).await.unwrap();
        batch.add_event(json!({"event_type": "login", "user": "alice"})).await.unwrap();

        assert_eq!(producer.events().len(), 2);
        assert_eq!(runtime.validation_cache().len(), 2);
        assert_eq!(runtime.metrics().counter(names::VALIDATION_FAILURES).await, 1);
        let hits_before = runtime.metrics().counter(names::VALIDATION_CACHE_HITS).await;

        let realtime = runtime.realtime_collector("okta-realtime", producer.clone());
        realtime.start().await.unwrap();
        realtime
            .collect_event(
                &tokio_util::sync::CancellationToken::new(),
                br#"{"event_type":"login","user":"alice"}"#.to_vec(),
            )
            .await
            .unwrap();
        realtime.stop().await.unwrap();
        assert_eq!(producer.events().len(), 3);
        assert_eq!(runtime.metrics().counter(names::VALIDATION_CACHE_HITS).await, hits_before + 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_integrations() {
        let runtime = runtime();
        runtime
            .registry()
            .register_platform("okta", StubPlatform::factory("okta"))
            .await
            .unwrap();
        runtime.manager().deploy_integration(IntegrationConfig::new("okta", "a")).await.unwrap();
        runtime.manager().deploy_integration(IntegrationConfig::new("okta", "b")).await.unwrap();

        runtime.shutdown().await.unwrap();

        assert!(runtime.manager().list_integrations().await.unwrap().is_empty());
        let err = runtime
            .deployer()
            .deploy(IntegrationConfig::new("okta", "c"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Lifecycle);
    }
}
