//! Per-node root-cause-analysis engine
//!
//! This crate provides the core functionality for:
//! - Flow units exchanged between analysis vertices
//! - Sliding-window vertices and their evaluation strategies
//! - The analysis graph and its periodic scheduler
//! - Peer-to-peer transport of flow units between cluster nodes
//! - Configuration snapshots, metric collection, health and observability

pub mod collector;
pub mod config;
pub mod error;
pub mod graph;
pub mod health;
pub mod models;
pub mod net;
pub mod observability;
pub mod scheduler;
pub mod vertex;
pub mod window;

pub use config::{ConfHandle, ConfReloader, RcaConf};
pub use error::{RcaError, RcaResult};
pub use graph::{AnalysisGraph, GraphContext, GraphDefinition, GraphRegistry};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use net::{NetworkConfig, NetworkLayer, NetworkWorker};
pub use observability::{RcaMetrics, StructuredLogger};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerStats};
pub use window::SlidingWindow;
