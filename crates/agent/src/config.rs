//! Agent settings
//!
//! Read from `RCA_AGENT_*` environment variables; every field has a default.

use anyhow::{Context, Result};
use rca_lib::{net::NetworkConfig, scheduler::SchedulerConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Agent settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AgentConfig {
    /// Address peers use to reach this node; stamped on outbound envelopes
    #[serde(default = "default_node_address")]
    pub node_address: String,

    /// Bind address for inbound peer traffic
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port of the health/metrics server
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Path of the RCA conf file
    #[serde(default = "default_conf_path")]
    pub conf_path: PathBuf,

    /// Scheduler tick in seconds
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,

    /// Upper bound on the graceful shutdown wait
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// JSON metrics document feeding the metric sources; no collection
    /// loop runs when unset
    #[serde(default)]
    pub metrics_file: Option<PathBuf>,

    #[serde(default = "default_max_concurrent_evaluations")]
    pub max_concurrent_evaluations: usize,

    /// Interval between peer queue flushes in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Silence after which a peer is marked stale, in seconds
    #[serde(default = "default_peer_staleness_secs")]
    pub peer_staleness_secs: u64,
}

fn default_node_address() -> String {
    "127.0.0.1:9650".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0:9650".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_conf_path() -> PathBuf {
    PathBuf::from("/etc/rca/rca.conf")
}

fn default_tick_secs() -> u64 {
    5
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_max_concurrent_evaluations() -> usize {
    rca_lib::scheduler::DEFAULT_MAX_CONCURRENT_EVALUATIONS
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_peer_staleness_secs() -> u64 {
    60
}

impl AgentConfig {
    /// Load settings from the environment
    pub fn load() -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("RCA_AGENT").try_parsing(true))
            .build()?;
        Self::from_config(source)
    }

    pub fn from_config(source: config::Config) -> Result<Self> {
        let config: AgentConfig = source
            .try_deserialize()
            .context("Invalid RCA_AGENT_* settings")?;

        if config.tick_secs == 0 {
            anyhow::bail!("tick_secs must be > 0");
        }
        Ok(config)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn network_config(&self) -> NetworkConfig {
        NetworkConfig {
            flush_interval: Duration::from_millis(self.flush_interval_ms.max(1)),
            peer_staleness: Duration::from_secs(self.peer_staleness_secs),
            ..NetworkConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_evaluations: self.max_concurrent_evaluations,
            ..SchedulerConfig::default()
        }
    }
}
