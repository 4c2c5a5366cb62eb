// iSECTECH Security Integrations - Configuration Management
// Core runtime settings and per-integration configuration
// Copyright (c) 2024 iSECTECH. All rights reserved.

use std::collections::HashMap;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use crate::error::{IntegrationError, Result};

/// Maximum length of an integration name
const MAX_INTEGRATION_NAME_LEN: usize = 128;

/// Configuration of a single platform integration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Registered platform type tag (e.g. "okta", "crowdstrike")
    pub platform_type: String,
    /// Human-readable integration name, unique per platform type
    pub name: String,
    /// Owning tenant
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Whether collection should start on deploy
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// How events are pulled from the platform
    #[serde(default)]
    pub collection_mode: CollectionMode,
    /// Polling interval for batch-mode platforms
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Credential references (secret names, never secret values)
    #[serde(default)]
    pub credentials: HashMap<String, String>,
    /// Platform-specific settings
    #[serde(default)]
    pub settings: HashMap<String, serde_json::Value>,
    /// Free-form tags
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Event collection mode of an integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionMode {
    /// Push/webhook or streaming delivery
    #[default]
    Realtime,
    /// Periodic polling
    Batch,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    300
}

impl IntegrationConfig {
    /// Create a configuration with defaults for everything but the identity
    pub fn new(platform_type: &str, name: &str) -> Self {
        Self {
            platform_type: platform_type.to_string(),
            name: name.to_string(),
            tenant_id: None,
            enabled: true,
            collection_mode: CollectionMode::default(),
            poll_interval_secs: default_poll_interval(),
            credentials: HashMap::new(),
            settings: HashMap::new(),
            tags: Vec::new(),
        }
    }

    /// Add a credential reference
    pub fn with_credential(mut self, key: &str, reference: &str) -> Self {
        self.credentials.insert(key.to_string(), reference.to_string());
        self
    }

    /// Add a platform setting
    pub fn with_setting(mut self, key: &str, value: serde_json::Value) -> Self {
        self.settings.insert(key.to_string(), value);
        self
    }

    /// Set the collection mode
    pub fn with_collection_mode(mut self, mode: CollectionMode) -> Self {
        self.collection_mode = mode;
        self
    }

    /// Structural checks that need no collaborator
    pub fn validate(&self) -> Result<()> {
        if self.platform_type.trim().is_empty() {
            return Err(IntegrationError::InvalidInput("Platform type cannot be empty".to_string()));
        }

        if self.name.trim().is_empty() {
            return Err(IntegrationError::InvalidInput("Integration name cannot be empty".to_string()));
        }

        if self.name.len() > MAX_INTEGRATION_NAME_LEN {
            return Err(IntegrationError::InvalidInput(format!(
                "Integration name exceeds {} characters", MAX_INTEGRATION_NAME_LEN
            )));
        }

        if !self.name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ' ')) {
            return Err(IntegrationError::InvalidInput(format!(
                "Integration name contains invalid characters: {}", self.name
            )));
        }

        if self.collection_mode == CollectionMode::Batch && self.poll_interval_secs == 0 {
            return Err(IntegrationError::InvalidInput(
                "Poll interval must be greater than 0 for batch collection".to_string(),
            ));
        }

        Ok(())
    }
}

/// Runtime configuration of the integration core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Platform registry settings
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Event collector settings
    #[serde(default)]
    pub collector: CollectorConfig,
    /// Deployment orchestration settings
    #[serde(default)]
    pub deployer: DeployerConfig,
    /// Validation settings
    #[serde(default)]
    pub validation: ValidationConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub cache_ttl_secs: u64,
    pub lock_timeout_secs: u64,
    pub rate_limit_burst: usize,
    pub rate_limit_per_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub batch_size: usize,
    pub buffer_size: usize,
    pub flush_interval_ms: u64,
    pub collection_timeout_ms: u64,
    pub lock_timeout_ms: u64,
    pub max_event_size_bytes: usize,
    pub max_json_depth: usize,
    pub max_publish_retries: u32,
    pub validation_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployerConfig {
    pub max_concurrent_deployments: usize,
    pub deployment_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub monitor_interval_ms: u64,
    pub metrics_interval_ms: u64,
    pub history_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub cache_ttl_secs: u64,
    pub max_cache_entries: usize,
    pub required_event_fields: Vec<String>,
    pub forbidden_patterns: Vec<String>,
    /// Credential keys every integration of a platform type must declare
    pub required_credentials: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub with_thread_ids: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 3600,
            lock_timeout_secs: 30,
            rate_limit_burst: 100,
            rate_limit_per_sec: 100.0,
        }
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            buffer_size: 10_000,
            flush_interval_ms: 5_000,
            collection_timeout_ms: 5_000,
            lock_timeout_ms: 30_000,
            max_event_size_bytes: 1024 * 1024,
            max_json_depth: 32,
            max_publish_retries: 3,
            validation_workers: 5,
        }
    }
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: 10,
            deployment_timeout_secs: 300,
            max_retries: 3,
            retry_base_delay_ms: 1_000,
            monitor_interval_ms: 10_000,
            metrics_interval_ms: 60_000,
            history_size: 100,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 300,
            max_cache_entries: 100_000,
            required_event_fields: Vec::new(),
            forbidden_patterns: vec![
                "<script".to_string(),
                "javascript:".to_string(),
                "${jndi:".to_string(),
            ],
            required_credentials: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
            with_thread_ids: true,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML or YAML file
    pub async fn load(path: &str) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await
            .map_err(|e| IntegrationError::Configuration(format!("Failed to read config file: {}", e)))?;

        let config: CoreConfig = if path.ends_with(".toml") {
            toml::from_str(&content)?
        } else if path.ends_with(".yaml") || path.ends_with(".yml") {
            serde_yaml::from_str(&content)?
        } else {
            return Err(IntegrationError::Configuration("Unsupported config format".to_string()));
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.registry.rate_limit_burst == 0 || self.registry.rate_limit_per_sec <= 0.0 {
            return Err(IntegrationError::Configuration("Registry rate limit must be positive".to_string()));
        }

        if self.registry.lock_timeout_secs == 0 {
            return Err(IntegrationError::Configuration("Registry lock timeout must be greater than 0".to_string()));
        }

        self.collector.validate()?;

        if self.deployer.max_concurrent_deployments == 0 {
            return Err(IntegrationError::Configuration("Deployment cap must be greater than 0".to_string()));
        }

        if self.deployer.max_retries == 0 {
            return Err(IntegrationError::Configuration("Deployer needs at least one attempt".to_string()));
        }

        if self.deployer.monitor_interval_ms == 0 || self.deployer.metrics_interval_ms == 0 {
            return Err(IntegrationError::Configuration("Monitor intervals must be greater than 0".to_string()));
        }

        if self.validation.cache_ttl_secs == 0 {
            return Err(IntegrationError::Configuration("Validation cache TTL must be greater than 0".to_string()));
        }

        Ok(())
    }

    /// Get test configuration with short intervals
    #[cfg(test)]
    pub fn test_default() -> Self {
        let mut config = Self::default();
        config.registry.lock_timeout_secs = 1;
        config.collector.batch_size = 3;
        config.collector.buffer_size = 16;
        config.collector.flush_interval_ms = 60_000;
        config.collector.collection_timeout_ms = 50;
        config.collector.lock_timeout_ms = 1_000;
        config.deployer.retry_base_delay_ms = 10;
        config.deployer.monitor_interval_ms = 10;
        config.deployer.metrics_interval_ms = 30;
        config.deployer.deployment_timeout_secs = 5;
        config
    }
}

impl RegistryConfig {
    /// Get platform instance cache TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// Get lock acquisition timeout as Duration
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }
}

impl CollectorConfig {
    /// Validate collector settings; also run when a collector starts
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IntegrationError::Configuration("Batch size must be greater than 0".to_string()));
        }

        if self.buffer_size < self.batch_size {
            return Err(IntegrationError::Configuration(
                "Collector buffer must hold at least one batch".to_string(),
            ));
        }

        if self.flush_interval_ms == 0 {
            return Err(IntegrationError::Configuration("Flush interval must be greater than 0".to_string()));
        }

        if self.validation_workers == 0 {
            return Err(IntegrationError::Configuration("At least one validation worker is required".to_string()));
        }

        if self.max_event_size_bytes == 0 || self.max_json_depth == 0 {
            return Err(IntegrationError::Configuration("Event size and depth limits must be positive".to_string()));
        }

        if self.max_publish_retries == 0 {
            return Err(IntegrationError::Configuration("Collector needs at least one publish attempt".to_string()));
        }

        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn collection_timeout(&self) -> Duration {
        Duration::from_millis(self.collection_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl DeployerConfig {
    pub fn deployment_timeout(&self) -> Duration {
        Duration::from_secs(self.deployment_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

impl ValidationConfig {
    /// Get validation result TTL as Duration
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_integration_config_validation() {
        assert!(IntegrationConfig::new("okta", "corp-sso").validate().is_ok());
        assert!(IntegrationConfig::new("", "corp-sso").validate().is_err());
        assert!(IntegrationConfig::new("okta", "  ").validate().is_err());
        assert!(IntegrationConfig::new("okta", "bad/name").validate().is_err());

        let mut batch = IntegrationConfig::new("aws", "cloudtrail")
            .with_collection_mode(CollectionMode::Batch);
        batch.poll_interval_secs = 0;
        assert!(batch.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = CoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.registry.rate_limit_burst, 100);
        assert_eq!(config.registry.lock_timeout(), Duration::from_secs(30));
        assert_eq!(config.registry.cache_ttl(), Duration::from_secs(3600));
        assert_eq!(config.validation.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.collector.validation_workers, 5);
    }

    #[test]
    fn test_invalid_batch_size_rejected() {
        let mut config = CoreConfig::default();
        config.collector.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_collector_config_rejects_zero_flush_interval() {
        let mut collector = CoreConfig::default().collector;
        assert!(collector.validate().is_ok());

        collector.flush_interval_ms = 0;
        let err = collector.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Configuration);
    }

    #[tokio::test]
    async fn test_load_toml() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[collector]\nbatch_size = 50\n\n[deployer]\nmax_concurrent_deployments = 4").unwrap();

        let config = CoreConfig::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.collector.batch_size, 50);
        assert_eq!(config.deployer.max_concurrent_deployments, 4);
        assert_eq!(config.registry.rate_limit_burst, 100);
    }

    #[tokio::test]
    async fn test_load_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "logging:\n  level: debug\n  format: text").unwrap();

        let config = CoreConfig::load(file.path().to_str().unwrap()).await.unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "text");
    }

    #[tokio::test]
    async fn test_load_unsupported_format() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result = CoreConfig::load(file.path().to_str().unwrap()).await;
        assert!(matches!(result, Err(IntegrationError::Configuration(_))));
    }
}
