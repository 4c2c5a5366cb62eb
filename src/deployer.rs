// iSECTECH Security Integrations - Deployer
// Admission control, retries and monitoring around integration deployment
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! Deployment orchestration on top of the [`IntegrationManager`].
//!
//! Each deployment is admitted against a concurrency cap, retried with linear
//! backoff on retryable failures, bounded by an overall deadline and watched
//! by a monitor task that exits when the deployment finishes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DeployerConfig, IntegrationConfig};
use crate::error::{ErrorContext, IntegrationError, Result};
use crate::manager::IntegrationManager;
use crate::metrics::{names, MetricsCollector};
use crate::registry::PlatformRegistry;
use crate::retry::{execute_with_retry, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    InProgress,
    Completed,
    Failed,
}

/// Tracking record for one deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub id: String,
    pub integration_name: String,
    pub platform_type: String,
    pub state: DeploymentState,
    pub start_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    /// Attempts made so far
    pub attempts: u32,
    /// Set once the manager accepted the integration
    pub integration_id: Option<String>,
    pub error: Option<String>,
    /// Last time the monitor observed this deployment
    pub last_checked: Option<DateTime<Utc>>,
}

type ActiveDeployments = Arc<Mutex<HashMap<String, DeploymentStatus>>>;

pub struct Deployer {
    manager: Arc<IntegrationManager>,
    registry: Arc<PlatformRegistry>,
    metrics: Arc<MetricsCollector>,
    config: DeployerConfig,
    active: ActiveDeployments,
    history: Mutex<VecDeque<DeploymentStatus>>,
    shutdown: CancellationToken,
}

impl Deployer {
    pub fn new(
        manager: Arc<IntegrationManager>,
        registry: Arc<PlatformRegistry>,
        metrics: Arc<MetricsCollector>,
        config: DeployerConfig,
    ) -> Self {
        Self {
            manager,
            registry,
            metrics,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(VecDeque::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Deploy an integration, returning the completed deployment record
    pub async fn deploy(&self, config: IntegrationConfig) -> Result<DeploymentStatus> {
        if self.shutdown.is_cancelled() {
            return Err(IntegrationError::Lifecycle("Deployer is shut down".to_string()));
        }

        self.validate_prerequisites(&config).await?;
        let deployment_id = self.admit(&config).await?;

        let started = Instant::now();
        let token = self.shutdown.child_token();
        let monitor = tokio::spawn(monitor_deployment(
            deployment_id.clone(),
            Arc::clone(&self.active),
            Arc::clone(&self.metrics),
            self.config.monitor_interval(),
            self.config.metrics_interval(),
            token.clone(),
        ));

        let deadline = token.child_token();
        let timer = {
            let deadline = deadline.clone();
            let timeout = self.config.deployment_timeout();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                deadline.cancel();
            })
        };

        let result = self.deploy_with_retry(&deployment_id, config, &deadline).await;
        let result = match result {
            Err(e) if deadline.is_cancelled() && !self.shutdown.is_cancelled() => {
                Err(IntegrationError::Timeout(format!(
                    "Deployment {} exceeded {:?}: {}",
                    deployment_id,
                    self.config.deployment_timeout(),
                    e
                )))
            }
            other => other,
        };

        timer.abort();
        token.cancel();
        if let Err(e) = monitor.await {
            warn!("Monitor of deployment {} ended abnormally: {}", deployment_id, e);
        }

        let status = self.finish(&deployment_id, &result).await;
        self.metrics
            .observe_duration(names::DEPLOYMENT_DURATION_MS, started.elapsed())
            .await;

        match result {
            Ok(integration_id) => {
                info!("Deployment {} completed as integration {}", deployment_id, integration_id);
                status.ok_or_else(|| {
                    IntegrationError::Internal(format!("Deployment {} record lost", deployment_id))
                })
            }
            Err(e) => {
                ErrorContext::new("deployer", "deploy")
                    .with_context("deployment_id", &deployment_id)
                    .log(&e);
                Err(e)
            }
        }
    }

    async fn validate_prerequisites(&self, config: &IntegrationConfig) -> Result<()> {
        config.validate()?;

        if !self.registry.is_registered(&config.platform_type).await? {
            return Err(IntegrationError::NotFound(format!(
                "Platform type not registered: {}", config.platform_type
            )));
        }

        Ok(())
    }

    /// Reserve a slot under the cap and record the deployment as in progress
    async fn admit(&self, config: &IntegrationConfig) -> Result<String> {
        let mut active = self.active.lock().await;

        if active.len() >= self.config.max_concurrent_deployments {
            drop(active);
            self.metrics.increment_counter(names::DEPLOYMENTS_REJECTED, 1).await;
            return Err(IntegrationError::CapacityExceeded(format!(
                "Maximum of {} concurrent deployments reached",
                self.config.max_concurrent_deployments
            )));
        }

        let id = Uuid::new_v4().to_string();
        active.insert(
            id.clone(),
            DeploymentStatus {
                id: id.clone(),
                integration_name: config.name.clone(),
                platform_type: config.platform_type.clone(),
                state: DeploymentState::InProgress,
                start_time: Utc::now(),
                completion_time: None,
                attempts: 0,
                integration_id: None,
                error: None,
                last_checked: None,
            },
        );
        let count = active.len();
        drop(active);

        self.metrics.increment_counter(names::DEPLOYMENTS_STARTED, 1).await;
        self.metrics.set_gauge(names::ACTIVE_DEPLOYMENTS, count as f64).await;
        debug!("Admitted deployment {} ({} active)", id, count);
        Ok(id)
    }

    async fn deploy_with_retry(
        &self,
        deployment_id: &str,
        config: IntegrationConfig,
        deadline: &CancellationToken,
    ) -> Result<String> {
        let policy = RetryPolicy::linear(self.config.max_retries, self.config.retry_base_delay());
        let config = &config;

        execute_with_retry(&policy, "deploy_integration", Some(deadline), |attempt| async move {
            if let Some(status) = self.active.lock().await.get_mut(deployment_id) {
                status.attempts = attempt;
            }
            if attempt > 1 {
                self.metrics.increment_counter(names::DEPLOYMENT_RETRIES, 1).await;
            }
            self.manager.deploy_integration_with(config.clone(), deadline).await
        })
        .await
    }

    /// Move the deployment from the active set to history
    async fn finish(&self, deployment_id: &str, result: &Result<String>) -> Option<DeploymentStatus> {
        let (mut status, remaining) = {
            let mut active = self.active.lock().await;
            let status = active.remove(deployment_id);
            (status?, active.len())
        };

        status.completion_time = Some(Utc::now());
        match result {
            Ok(integration_id) => {
                status.state = DeploymentState::Completed;
                status.integration_id = Some(integration_id.clone());
                self.metrics.increment_counter(names::DEPLOYMENTS_SUCCEEDED, 1).await;
            }
            Err(e) => {
                status.state = DeploymentState::Failed;
                status.error = Some(e.to_string());
                self.metrics.increment_counter(names::DEPLOYMENTS_FAILED, 1).await;
            }
        }
        self.metrics.set_gauge(names::ACTIVE_DEPLOYMENTS, remaining as f64).await;

        let mut history = self.history.lock().await;
        history.push_back(status.clone());
        while history.len() > self.config.history_size {
            history.pop_front();
        }

        Some(status)
    }

    /// Look up a deployment among active ones, then in history
    pub async fn deployment_status(&self, deployment_id: &str) -> Result<DeploymentStatus> {
        if let Some(status) = self.active.lock().await.get(deployment_id) {
            return Ok(status.clone());
        }

        self.history
            .lock()
            .await
            .iter()
            .rev()
            .find(|s| s.id == deployment_id)
            .cloned()
            .ok_or_else(|| IntegrationError::NotFound(format!("Deployment not found: {}", deployment_id)))
    }

    pub async fn active_deployments(&self) -> Vec<DeploymentStatus> {
        let mut active: Vec<DeploymentStatus> = self.active.lock().await.values().cloned().collect();
        active.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        active
    }

    /// Finished deployments, oldest first
    pub async fn deployment_history(&self) -> Vec<DeploymentStatus> {
        self.history.lock().await.iter().cloned().collect()
    }

    /// Stop and remove a deployed integration
    pub async fn undeploy(&self, integration_id: &str) -> Result<()> {
        self.manager.stop_integration(integration_id).await
    }

    /// Cancel in-flight deployments and refuse new ones
    pub fn shutdown(&self) {
        info!("Deployer shutting down");
        self.shutdown.cancel();
    }
}

/// Poll one deployment until `token` fires or the deployment leaves the active set
async fn monitor_deployment(
    deployment_id: String,
    active: ActiveDeployments,
    metrics: Arc<MetricsCollector>,
    monitor_interval: Duration,
    metrics_interval: Duration,
    token: CancellationToken,
) {
    let mut poll = tokio::time::interval(monitor_interval);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut report = tokio::time::interval(metrics_interval);
    report.set_missed_tick_behavior(MissedTickBehavior::Delay);
    poll.tick().await;
    report.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = poll.tick() => {
                let mut active = active.lock().await;
                let Some(status) = active.get_mut(&deployment_id) else { break };
                status.last_checked = Some(Utc::now());
                debug!(
                    "Deployment {} in progress for {}ms (attempt {})",
                    deployment_id,
                    (Utc::now() - status.start_time).num_milliseconds(),
                    status.attempts
                );
            }
            _ = report.tick() => {
                let count = active.lock().await.len();
                metrics.set_gauge(names::ACTIVE_DEPLOYMENTS, count as f64).await;
            }
        }
    }

    debug!("Monitor of deployment {} exiting", deployment_id);
}
