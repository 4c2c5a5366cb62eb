// iSECTECH Security Integrations - Platform Capability
// Pluggable adapters for third-party security platforms
// Copyright (c) 2024 iSECTECH. All rights reserved.

//! The [`Platform`] capability implemented by every third-party adapter
//! (identity providers, cloud platforms, EDR tools).
//!
//! The core never depends on a concrete platform. Adapters are constructed by
//! a [`PlatformFactory`] registered under a type tag in the
//! [`PlatformRegistry`](crate::registry::PlatformRegistry).

use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::IntegrationConfig;
use crate::error::Result;

/// Capability interface of a platform adapter.
///
/// Instances are shared (`Arc`) between the registry cache and the manager,
/// so implementations use interior mutability for their collection state.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Prepare the adapter for the given integration (credential exchange, API discovery)
    async fn initialize(&self, config: &IntegrationConfig) -> Result<()>;

    /// Begin delivering events
    async fn start_collection(&self) -> Result<()>;

    /// Stop delivering events
    async fn stop_collection(&self) -> Result<()>;

    /// Report current health and collection progress
    async fn get_status(&self) -> Result<PlatformStatus>;
}

/// Constructor registered for a platform type.
///
/// Returns `Ok(None)` when it produced no platform, which the registry treats
/// as a broken factory.
pub type PlatformFactory = Arc<dyn Fn() -> Result<Option<Arc<dyn Platform>>> + Send + Sync>;

/// Wrap a closure as a [`PlatformFactory`]
pub fn platform_factory<F>(factory: F) -> PlatformFactory
where
    F: Fn() -> Result<Option<Arc<dyn Platform>>> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Collection state reported by a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformState {
    Initialized,
    Collecting,
    Stopped,
    Degraded,
    Failed,
}

/// Health snapshot returned by [`Platform::get_status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformStatus {
    /// Platform type tag
    pub platform_type: String,
    /// Current collection state
    pub state: PlatformState,
    /// Whether the platform considers itself healthy
    pub healthy: bool,
    /// Events delivered since collection started
    pub events_collected: u64,
    /// Time of the most recent event
    pub last_event_at: Option<DateTime<Utc>>,
    /// Human-readable status detail
    pub message: Option<String>,
    /// Adapter-specific details
    #[serde(default)]
    pub details: HashMap<String, String>,
}

impl PlatformStatus {
    /// Healthy status in the given state
    pub fn healthy(platform_type: &str, state: PlatformState) -> Self {
        Self {
            platform_type: platform_type.to_string(),
            state,
            healthy: true,
            events_collected: 0,
            last_event_at: None,
            message: None,
            details: HashMap::new(),
        }
    }

    /// Unhealthy status with an explanation
    pub fn unhealthy(platform_type: &str, message: &str) -> Self {
        Self {
            platform_type: platform_type.to_string(),
            state: PlatformState::Degraded,
            healthy: false,
            events_collected: 0,
            last_event_at: None,
            message: Some(message.to_string()),
            details: HashMap::new(),
        }
    }
}
