// iSECTECH Security Integrations - Integration Manager
// Lifecycle of deployed integrations
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Integration lifecycle: validate, initialize, record, start, stop.
//!
//! Platform calls never run under the integrations lock. A record becomes
//! visible to listing and status queries only after its platform has started
//! collecting; if start fails the record is removed again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IntegrationConfig;
use crate::error::{ErrorContext, IntegrationError, Result};
use crate::locks::{read_with_timeout, write_with_timeout};
use crate::metrics::{names, MetricsCollector};
use crate::platform::{Platform, PlatformStatus};
use crate::registry::PlatformRegistry;
use crate::validation::Validator;

/// Lifecycle state of a deployed integration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationState {
    /// Recorded, platform start in progress (not yet visible)
    Starting,
    /// Platform is collecting
    Active,
    /// Deployed with collection disabled
    Idle,
    /// Last status query reported a problem
    Degraded,
    /// Stop in progress
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationStatus {
    pub state: IntegrationState,
    /// Most recent platform report
    pub platform_status: Option<PlatformStatus>,
    /// Most recent failure, if any
    pub last_error: Option<String>,
}

impl IntegrationStatus {
    fn new(state: IntegrationState) -> Self {
        Self {
            state,
            platform_status: None,
            last_error: None,
        }
    }
}

/// A deployed integration
pub struct Integration {
    pub id: String,
    pub config: IntegrationConfig,
    pub platform: Arc<dyn Platform>,
    pub status: IntegrationStatus,
    pub deployed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Integration {
    fn info(&self) -> IntegrationInfo {
        IntegrationInfo {
            id: self.id.clone(),
            config: self.config.clone(),
            status: self.status.clone(),
            deployed_at: self.deployed_at,
            last_updated: self.last_updated,
        }
    }

    fn is_visible(&self) -> bool {
        self.status.state != IntegrationState::Starting
    }
}

/// Snapshot of an integration returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationInfo {
    pub id: String,
    pub config: IntegrationConfig,
    pub status: IntegrationStatus,
    pub deployed_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

/// Manager counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManagerMetrics {
    pub active_integrations: usize,
    pub deployments_total: u64,
    pub deployment_failures: u64,
    pub rollbacks: u64,
    pub stops_total: u64,
    pub stop_failures: u64,
}

#[derive(Debug, Default)]
struct ManagerCounters {
    deployments: AtomicU64,
    deployment_failures: AtomicU64,
    rollbacks: AtomicU64,
    stops: AtomicU64,
    stop_failures: AtomicU64,
}

/// Owns the set of deployed integrations
pub struct IntegrationManager {
    registry: Arc<PlatformRegistry>,
    validator: Arc<dyn Validator>,
    metrics: Arc<MetricsCollector>,
    integrations: RwLock<HashMap<String, Integration>>,
    counters: ManagerCounters,
    lock_timeout: Duration,
}

impl IntegrationManager {
    pub fn new(
        registry: Arc<PlatformRegistry>,
        validator: Arc<dyn Validator>,
        metrics: Arc<MetricsCollector>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            validator,
            metrics,
            integrations: RwLock::new(HashMap::new()),
            counters: ManagerCounters::default(),
            lock_timeout,
        }
    }

    /// Deploy an integration and return its ID
    pub async fn deploy_integration(&self, config: IntegrationConfig) -> Result<String> {
        self.deploy_integration_with(config, &CancellationToken::new()).await
    }

    /// Deploy an integration, abandoning platform calls once `cancel` fires.
    ///
    /// On any failure after the record was created, the record is removed.
    pub async fn deploy_integration_with(
        &self,
        config: IntegrationConfig,
        cancel: &CancellationToken,
    ) -> Result<String> {
        self.counters.deployments.fetch_add(1, Ordering::Relaxed);

        let result = self.deploy_inner(config, cancel).await;
        if result.is_err() {
            self.counters.deployment_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    async fn deploy_inner(&self, config: IntegrationConfig, cancel: &CancellationToken) -> Result<String> {
        let context = ErrorContext::new("integration_manager", "deploy_integration")
            .with_context("platform_type", &config.platform_type)
            .with_context("name", &config.name);

        if let Err(e) = until_cancelled(cancel, "config validation", self.validator.validate_config(&config)).await {
            context.log(&e);
            return Err(e);
        }

        let platform = until_cancelled(cancel, "platform lookup", self.registry.get_platform(&config.platform_type))
            .await
            .map_err(|e| {
                context.log(&e);
                e
            })?;

        until_cancelled(cancel, "platform initialization", platform.initialize(&config))
            .await
            .map_err(|e| {
                let error = IntegrationError::dependency(
                    format!("initializing platform {} for {}", config.platform_type, config.name),
                    e,
                );
                context.log(&error);
                error
            })?;

        let id = generate_integration_id(&config);
        let now = Utc::now();
        let collect = config.enabled;
        {
            let mut integrations = write_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
            if integrations.contains_key(&id) {
                return Err(IntegrationError::AlreadyExists(format!("Integration ID collision: {}", id)));
            }
            integrations.insert(
                id.clone(),
                Integration {
                    id: id.clone(),
                    config,
                    platform: Arc::clone(&platform),
                    status: IntegrationStatus::new(IntegrationState::Starting),
                    deployed_at: now,
                    last_updated: now,
                },
            );
        }

        let started = if collect {
            until_cancelled(cancel, "platform start", platform.start_collection()).await
        } else {
            Ok(())
        };

        if let Err(e) = started {
            self.rollback(&id).await;
            let error = IntegrationError::dependency(format!("starting collection for integration {}", id), e);
            context.with_context("integration_id", &id).log(&error);
            return Err(error);
        }

        let active = {
            let mut integrations = write_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
            if let Some(integration) = integrations.get_mut(&id) {
                integration.status.state = if collect { IntegrationState::Active } else { IntegrationState::Idle };
                integration.last_updated = Utc::now();
            }
            integrations.values().filter(|i| i.is_visible()).count()
        };
        self.metrics.set_gauge(names::ACTIVE_INTEGRATIONS, active as f64).await;

        info!("Deployed integration {}", id);
        Ok(id)
    }

    async fn rollback(&self, id: &str) {
        self.counters.rollbacks.fetch_add(1, Ordering::Relaxed);
        // Unbounded wait: the record must not outlive a failed start
        self.integrations.write().await.remove(id);
        warn!("Rolled back integration {}", id);
    }

    /// Stop collection and remove the integration.
    ///
    /// If the platform fails to stop, the integration stays deployed in its
    /// previous state with the error recorded.
    pub async fn stop_integration(&self, id: &str) -> Result<()> {
        let (platform, previous) = {
            let mut integrations = write_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
            let integration = integrations
                .get_mut(id)
                .filter(|i| i.is_visible())
                .ok_or_else(|| not_found(id))?;

            if integration.status.state == IntegrationState::Stopping {
                return Err(IntegrationError::Lifecycle(format!("Integration {} is already stopping", id)));
            }

            let previous = integration.status.state;
            integration.status.state = IntegrationState::Stopping;
            (Arc::clone(&integration.platform), previous)
        };

        if previous != IntegrationState::Idle {
            if let Err(e) = platform.stop_collection().await {
                self.counters.stop_failures.fetch_add(1, Ordering::Relaxed);
                let mut integrations = self.integrations.write().await;
                if let Some(integration) = integrations.get_mut(id) {
                    integration.status.state = previous;
                    integration.status.last_error = Some(e.to_string());
                    integration.last_updated = Utc::now();
                }
                drop(integrations);

                let error = IntegrationError::dependency(format!("stopping integration {}", id), e);
                ErrorContext::new("integration_manager", "stop_integration")
                    .with_context("integration_id", id)
                    .log(&error);
                return Err(error);
            }
        }

        let active = {
            let mut integrations = self.integrations.write().await;
            integrations.remove(id);
            integrations.values().filter(|i| i.is_visible()).count()
        };
        self.counters.stops.fetch_add(1, Ordering::Relaxed);
        self.metrics.set_gauge(names::ACTIVE_INTEGRATIONS, active as f64).await;

        info!("Stopped integration {}", id);
        Ok(())
    }

    /// Re-query the platform and refresh the stored status
    pub async fn get_integration_status(&self, id: &str) -> Result<IntegrationStatus> {
        let platform = {
            let integrations = read_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
            let integration = integrations.get(id).filter(|i| i.is_visible()).ok_or_else(|| not_found(id))?;
            Arc::clone(&integration.platform)
        };

        let reported = platform.get_status().await;

        let mut integrations = write_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
        let integration = integrations.get_mut(id).ok_or_else(|| not_found(id))?;
        let refreshable = matches!(
            integration.status.state,
            IntegrationState::Active | IntegrationState::Degraded
        );

        match reported {
            Ok(status) => {
                if refreshable {
                    integration.status.state = if status.healthy {
                        IntegrationState::Active
                    } else {
                        IntegrationState::Degraded
                    };
                }
                integration.status.platform_status = Some(status);
            }
            Err(e) => {
                debug!("Status query for integration {} failed: {}", id, e);
                if refreshable {
                    integration.status.state = IntegrationState::Degraded;
                }
                integration.status.last_error = Some(e.to_string());
            }
        }
        integration.last_updated = Utc::now();

        Ok(integration.status.clone())
    }

    /// Snapshot of one integration without querying the platform
    pub async fn get_integration(&self, id: &str) -> Result<IntegrationInfo> {
        let integrations = read_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
        integrations
            .get(id)
            .filter(|i| i.is_visible())
            .map(Integration::info)
            .ok_or_else(|| not_found(id))
    }

    /// Snapshots of all deployed integrations, oldest first
    pub async fn list_integrations(&self) -> Result<Vec<IntegrationInfo>> {
        let integrations = read_with_timeout(&self.integrations, self.lock_timeout, "integrations").await?;
        let mut list: Vec<IntegrationInfo> = integrations
            .values()
            .filter(|i| i.is_visible())
            .map(Integration::info)
            .collect();
        list.sort_by(|a, b| a.deployed_at.cmp(&b.deployed_at).then_with(|| a.id.cmp(&b.id)));
        Ok(list)
    }

    pub async fn get_metrics(&self) -> ManagerMetrics {
        let active_integrations = self
            .integrations
            .read()
            .await
            .values()
            .filter(|i| i.is_visible())
            .count();

        ManagerMetrics {
            active_integrations,
            deployments_total: self.counters.deployments.load(Ordering::Relaxed),
            deployment_failures: self.counters.deployment_failures.load(Ordering::Relaxed),
            rollbacks: self.counters.rollbacks.load(Ordering::Relaxed),
            stops_total: self.counters.stops.load(Ordering::Relaxed),
            stop_failures: self.counters.stop_failures.load(Ordering::Relaxed),
        }
    }
}

/// `<platform>-<name>-<unix nanos>`, name lowercased with spaces as dashes
fn generate_integration_id(config: &IntegrationConfig) -> String {
    let name: String = config
        .name
        .trim()
        .chars()
        .map(|c| if c.is_whitespace() { '-' } else { c.to_ascii_lowercase() })
        .collect();
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("{}-{}-{}", config.platform_type, name, nanos)
}

fn not_found(id: &str) -> IntegrationError {
    IntegrationError::NotFound(format!("Integration not found: {}", id))
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    operation: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(IntegrationError::Cancelled(format!("{} cancelled", operation))),
        result = future => result,
    }
}
