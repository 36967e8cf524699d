//! Component health of the RCA agent
//!
//! Every long-running part of the engine reports here:
//! - scheduler: degraded after a tick with failed evaluations or one that
//!   overran the tick, unhealthy once its loop is gone
//! - network: degraded while any peer is stale
//! - config: degraded after a failed reload; the previous snapshot stays live
//! - collector: degraded while local metrics cannot be read
//!
//! Liveness is the worst reported status; readiness additionally needs the
//! graph to be running.

use crate::models::{now_millis, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still evaluating, with reduced coverage
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

/// Last report of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Epoch millis since which this status and message have held
    pub since: Timestamp,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            since: now_millis(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }

    fn same_report(&self, other: &ComponentHealth) -> bool {
        self.status == other.status && self.message == other.message
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among `components`; healthy when nothing reported
    pub fn compute_status(components: &BTreeMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const SCHEDULER: &str = "scheduler";
    pub const NETWORK: &str = "network";
    pub const CONFIG: &str = "config";
    pub const COLLECTOR: &str = "collector";

    /// Every component the agent registers at startup
    pub const ALL: &[&str] = &[SCHEDULER, NETWORK, CONFIG, COLLECTOR];
}

#[derive(Debug, Default)]
struct RegistryState {
    components: BTreeMap<String, ComponentHealth>,
    graph_running: bool,
}

/// Shared health state, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.register_all(&[name]).await;
    }

    /// Register components as healthy; existing reports are kept
    pub async fn register_all(&self, names: &[&str]) {
        let mut state = self.state.write().await;
        for name in names {
            state
                .components
                .entry(name.to_string())
                .or_insert_with(ComponentHealth::healthy);
        }
    }

    /// Record a report. Repeating the current report keeps its `since`.
    /// Returns whether the status or message changed.
    pub async fn report(&self, name: &str, health: ComponentHealth) -> bool {
        let mut state = self.state.write().await;
        if let Some(current) = state.components.get(name) {
            if current.same_report(&health) {
                return false;
            }
        }

        match (health.status, health.message.as_deref()) {
            (ComponentStatus::Healthy, _) => info!(component = %name, "Component healthy"),
            (status, message) => warn!(
                component = %name,
                status = ?status,
                message = message.unwrap_or_default(),
                "Component health changed"
            ),
        }
        state.components.insert(name.to_string(), health);
        true
    }

    pub async fn set_healthy(&self, name: &str) {
        self.report(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.report(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Current report of one component
    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    /// Mark whether the analysis graph is running
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.graph_running = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        HealthResponse {
            status: HealthResponse::compute_status(&components),
            components,
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.graph_running {
            return ReadinessResponse {
                ready: false,
                reason: Some("Analysis graph not yet running".to_string()),
            };
        }

        let failed: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, c)| !c.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();
        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", failed.join(", "))),
            }
        }
    }
}
