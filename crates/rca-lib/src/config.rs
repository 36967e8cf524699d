//! RCA configuration snapshot
//!
//! The configuration file is JSON with kebab-case keys. Once parsed it is
//! frozen into an [`RcaConf`] and shared as an `Arc` through [`ConfHandle`];
//! a reload builds a whole new snapshot and swaps the pointer, so readers
//! never observe a partially updated configuration.

use crate::error::{RcaError, RcaResult};
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::models::{now_millis, Timestamp};
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Datastore key under which the RCA log directory is stored
pub const DATASTORE_LOC_KEY: &str = "rca-log-directory";

/// Threshold sub-config of the old-gen heap RCA
pub const OLD_GEN_RCA_CONF_KEY: &str = "high-heap-usage-old-gen-rca";

/// Threshold sub-config of the young-gen heap RCA
pub const YOUNG_GEN_RCA_CONF_KEY: &str = "high-heap-usage-young-gen-rca";

/// File name looked up when the threshold store location is a directory
pub const THRESHOLD_FILE_NAME: &str = "thresholds.json";

/// Upper bound on the check periods, one week
pub const MAX_CHECK_PERIOD_MINS: u64 = 7 * 24 * 60;

/// Free-form threshold settings of one RCA
///
/// Values may be written as JSON numbers or as strings; getters accept both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdSettings(BTreeMap<String, serde_json::Value>);

impl ThresholdSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n.as_u64().map(|v| v as usize),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }

    pub fn usize_or(&self, key: &str, default: usize) -> usize {
        self.get_usize(key).unwrap_or(default)
    }

    /// Entries of `other` win over entries of `self`
    pub fn merged_with(&self, other: &ThresholdSettings) -> ThresholdSettings {
        let mut merged = self.0.clone();
        merged.extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
        ThresholdSettings(merged)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Old-gen heap RCA settings
#[derive(Debug, Clone, PartialEq)]
pub struct HighHeapUsageOldGenRcaConfig {
    pub top_k: usize,
}

impl HighHeapUsageOldGenRcaConfig {
    pub const DEFAULT_TOP_K: usize = 3;

    pub fn from_settings(settings: &ThresholdSettings) -> Self {
        Self {
            top_k: settings.usize_or("top-k", Self::DEFAULT_TOP_K),
        }
    }
}

/// Immutable RCA configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RcaConf {
    #[serde(rename = "rca-store-location", default)]
    pub rca_store_loc: String,

    #[serde(rename = "threshold-store-location", default)]
    pub threshold_store_loc: String,

    #[serde(rename = "new-rca-check-minutes", default = "default_check_minutes")]
    pub new_rca_check_period_mins: u64,

    #[serde(rename = "new-threshold-check-minutes", default = "default_check_minutes")]
    pub new_threshold_check_period_mins: u64,

    #[serde(rename = "remote-peers", default)]
    pub peer_ip_list: Vec<String>,

    #[serde(rename = "tags", default)]
    pub tag_map: BTreeMap<String, String>,

    #[serde(default)]
    pub datastore: BTreeMap<String, String>,

    #[serde(rename = "analysis-graph-implementor", default = "default_entry_point")]
    pub analysis_graph_entry_point: String,

    #[serde(default = "default_network_queue_length")]
    pub network_queue_length: usize,

    #[serde(rename = "max-flow-units-per-vertex-buffer", default = "default_buffer_length")]
    pub per_vertex_buffer_length: usize,

    #[serde(rename = "high-heap-usage-old-gen-rca", default)]
    pub old_gen_rca_settings: ThresholdSettings,

    #[serde(rename = "high-heap-usage-young-gen-rca", default)]
    pub young_gen_rca_settings: ThresholdSettings,

    #[serde(
        rename = "muted-rcas",
        default,
        deserialize_with = "deserialize_muted_rcas",
        serialize_with = "serialize_muted_rcas"
    )]
    pub muted_rca_list: Vec<String>,

    /// Per-RCA overrides read from the threshold store
    #[serde(skip)]
    pub threshold_overrides: BTreeMap<String, ThresholdSettings>,

    #[serde(skip_deserializing, default = "now_millis")]
    pub creation_time: Timestamp,
}

fn default_check_minutes() -> u64 {
    1
}

fn default_entry_point() -> String {
    crate::graph::DEFAULT_ENTRY_POINT.to_string()
}

fn default_network_queue_length() -> usize {
    200
}

fn default_buffer_length() -> usize {
    100
}

/// Split a comma separated list, tolerating whitespace around each comma.
/// Tokens are trimmed and empty tokens dropped; `""` yields an empty list.
pub fn parse_muted_rcas(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_muted_rcas<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.as_deref().map(parse_muted_rcas).unwrap_or_default())
}

fn serialize_muted_rcas<S>(list: &[String], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&list.join(","))
}

impl Default for RcaConf {
    fn default() -> Self {
        Self {
            rca_store_loc: String::new(),
            threshold_store_loc: String::new(),
            new_rca_check_period_mins: default_check_minutes(),
            new_threshold_check_period_mins: default_check_minutes(),
            peer_ip_list: Vec::new(),
            tag_map: BTreeMap::new(),
            datastore: BTreeMap::new(),
            analysis_graph_entry_point: default_entry_point(),
            network_queue_length: default_network_queue_length(),
            per_vertex_buffer_length: default_buffer_length(),
            old_gen_rca_settings: ThresholdSettings::default(),
            young_gen_rca_settings: ThresholdSettings::default(),
            muted_rca_list: Vec::new(),
            threshold_overrides: BTreeMap::new(),
            creation_time: now_millis(),
        }
    }
}

impl RcaConf {
    /// Parse a configuration document
    pub fn from_json_str(json: &str) -> RcaResult<Self> {
        let conf: RcaConf = serde_json::from_str(json)
            .map_err(|e| RcaError::configuration(format!("invalid rca conf: {e}")))?;
        conf.validate()?;
        Ok(conf)
    }

    /// Read and parse a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read rca conf {:?}", path))?;
        let conf = Self::from_json_str(&text)?;
        debug!(path = %path.display(), peers = conf.peer_ip_list.len(), "Loaded rca conf");
        Ok(conf)
    }

    fn validate(&self) -> RcaResult<()> {
        if self.network_queue_length == 0 {
            return Err(RcaError::configuration("network-queue-length must be > 0"));
        }
        if self.per_vertex_buffer_length == 0 {
            return Err(RcaError::configuration(
                "max-flow-units-per-vertex-buffer must be > 0",
            ));
        }
        for (key, mins) in [
            ("new-rca-check-minutes", self.new_rca_check_period_mins),
            ("new-threshold-check-minutes", self.new_threshold_check_period_mins),
        ] {
            if mins > MAX_CHECK_PERIOD_MINS {
                return Err(RcaError::configuration(format!(
                    "{key} must be <= {MAX_CHECK_PERIOD_MINS}, got {mins}"
                )));
            }
        }
        Ok(())
    }

    pub fn is_muted(&self, rca_name: &str) -> bool {
        self.muted_rca_list.iter().any(|m| m == rca_name)
    }

    pub fn is_known_peer(&self, address: &str) -> bool {
        self.peer_ip_list.iter().any(|p| p == address)
    }

    pub fn datastore_location(&self, key: &str) -> Option<&str> {
        self.datastore.get(key).map(String::as_str)
    }

    /// Record where RCA logs go. Only meaningful before the conf is frozen
    /// into a snapshot.
    pub fn set_datastore_rca_log_directory(&mut self, location: impl Into<String>) {
        self.datastore
            .insert(DATASTORE_LOC_KEY.to_string(), location.into());
    }

    /// Threshold settings of an RCA, with threshold-store overrides applied
    pub fn thresholds_for(&self, rca_conf_key: &str) -> ThresholdSettings {
        let base = match rca_conf_key {
            OLD_GEN_RCA_CONF_KEY => self.old_gen_rca_settings.clone(),
            YOUNG_GEN_RCA_CONF_KEY => self.young_gen_rca_settings.clone(),
            _ => ThresholdSettings::default(),
        };

        match self.threshold_overrides.get(rca_conf_key) {
            Some(overrides) => base.merged_with(overrides),
            None => base,
        }
    }

    pub fn old_gen_rca_config(&self) -> HighHeapUsageOldGenRcaConfig {
        HighHeapUsageOldGenRcaConfig::from_settings(&self.thresholds_for(OLD_GEN_RCA_CONF_KEY))
    }

    pub fn rca_check_period(&self) -> Duration {
        Duration::from_secs(self.new_rca_check_period_mins.max(1).saturating_mul(60))
    }

    pub fn threshold_check_period(&self) -> Duration {
        Duration::from_secs(self.new_threshold_check_period_mins.max(1).saturating_mul(60))
    }

    /// Threshold file to poll, if a threshold store is configured
    pub fn threshold_file(&self) -> Option<PathBuf> {
        if self.threshold_store_loc.is_empty() {
            return None;
        }
        let path = PathBuf::from(&self.threshold_store_loc);
        if path.is_dir() {
            Some(path.join(THRESHOLD_FILE_NAME))
        } else {
            Some(path)
        }
    }

    /// Copy of this snapshot with new threshold overrides
    pub fn with_threshold_overrides(&self, overrides: BTreeMap<String, ThresholdSettings>) -> Self {
        Self {
            threshold_overrides: overrides,
            creation_time: now_millis(),
            ..self.clone()
        }
    }
}

/// Read the per-RCA threshold overrides stored at `path`.
/// A missing file yields `None`.
pub fn load_threshold_overrides(path: &Path) -> Result<Option<BTreeMap<String, ThresholdSettings>>> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read threshold store {:?}", path))?;
    let overrides = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse threshold store {:?}", path))?;
    Ok(Some(overrides))
}

/// Process-wide handle to the live configuration snapshot
pub struct ConfHandle {
    current: ArcSwap<RcaConf>,
}

impl ConfHandle {
    pub fn new(conf: RcaConf) -> Self {
        Self {
            current: ArcSwap::from_pointee(conf),
        }
    }

    /// Current snapshot
    pub fn load(&self) -> Arc<RcaConf> {
        self.current.load_full()
    }

    /// Replace the snapshot wholesale, returning the previous one
    pub fn replace(&self, conf: RcaConf) -> Arc<RcaConf> {
        self.current.swap(Arc::new(conf))
    }
}

impl std::fmt::Debug for ConfHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfHandle")
            .field("current", &self.current.load_full())
            .finish()
    }
}

type ReloadListener = Box<dyn Fn(&RcaConf) + Send + Sync>;

/// Periodically re-reads the conf file and the threshold store
pub struct ConfReloader {
    path: PathBuf,
    handle: Arc<ConfHandle>,
    last_text: Mutex<Option<String>>,
    listeners: Vec<ReloadListener>,
    failures: Mutex<ReloadFailures>,
    health: Option<HealthRegistry>,
}

/// Latest error of each reload source
#[derive(Debug, Default)]
struct ReloadFailures {
    conf: Option<String>,
    thresholds: Option<String>,
}

impl ReloadFailures {
    fn health(&self) -> ComponentHealth {
        match (&self.conf, &self.thresholds) {
            (None, None) => ComponentHealth::healthy(),
            (Some(e), None) => ComponentHealth::degraded(format!("conf reload failed: {e}")),
            (None, Some(e)) => ComponentHealth::degraded(format!("threshold reload failed: {e}")),
            (Some(c), Some(t)) => ComponentHealth::degraded(format!(
                "conf reload failed: {c}; threshold reload failed: {t}"
            )),
        }
    }
}

impl ConfReloader {
    pub fn new(path: impl Into<PathBuf>, handle: Arc<ConfHandle>) -> Self {
        Self {
            path: path.into(),
            handle,
            last_text: Mutex::new(None),
            listeners: Vec::new(),
            failures: Mutex::new(ReloadFailures::default()),
            health: None,
        }
    }

    /// Report failed reloads into `health`
    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Register a callback invoked with every newly swapped snapshot
    pub fn on_reload(mut self, listener: impl Fn(&RcaConf) + Send + Sync + 'static) -> Self {
        self.listeners.push(Box::new(listener));
        self
    }

    /// Re-read the conf file; swaps the snapshot when its content changed
    pub fn reload_conf(&self) -> Result<bool> {
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read rca conf {:?}", self.path))?;

        if self.last_text.lock().as_deref() == Some(text.as_str()) {
            return Ok(false);
        }

        // Invalid content is not remembered, so it keeps failing until fixed
        let mut conf = RcaConf::from_json_str(&text)?;
        *self.last_text.lock() = Some(text);
        let previous = self.handle.load();
        conf.threshold_overrides = previous.threshold_overrides.clone();
        if let Some(dir) = previous.datastore_location(DATASTORE_LOC_KEY) {
            if conf.datastore_location(DATASTORE_LOC_KEY).is_none() {
                conf.set_datastore_rca_log_directory(dir);
            }
        }

        self.swap(conf);
        Ok(true)
    }

    /// Re-read the threshold store; swaps the snapshot when overrides changed
    pub fn reload_thresholds(&self) -> Result<bool> {
        let current = self.handle.load();
        let Some(path) = current.threshold_file() else {
            return Ok(false);
        };
        let Some(overrides) = load_threshold_overrides(&path)? else {
            return Ok(false);
        };
        if overrides == current.threshold_overrides {
            return Ok(false);
        }

        self.swap(current.with_threshold_overrides(overrides));
        Ok(true)
    }

    fn swap(&self, conf: RcaConf) {
        let conf = Arc::new(conf);
        self.handle.current.store(Arc::clone(&conf));
        for listener in &self.listeners {
            listener(&conf);
        }
        info!(
            event = "config_reloaded",
            peers = conf.peer_ip_list.len(),
            muted = conf.muted_rca_list.len(),
            "Configuration snapshot replaced"
        );
    }

    /// Reload the conf file, logging and reporting a failure
    pub async fn poll_conf(&self) {
        let error = match self.reload_conf() {
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Configuration reload failed, keeping previous snapshot");
                Some(format!("{e:#}"))
            }
        };
        let health = {
            let mut failures = self.failures.lock();
            failures.conf = error;
            failures.health()
        };
        self.report(health).await;
    }

    /// Reload the threshold store, logging and reporting a failure
    pub async fn poll_thresholds(&self) {
        let error = match self.reload_thresholds() {
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Threshold reload failed, keeping previous snapshot");
                Some(format!("{e:#}"))
            }
        };
        let health = {
            let mut failures = self.failures.lock();
            failures.thresholds = error;
            failures.health()
        };
        self.report(health).await;
    }

    async fn report(&self, health: ComponentHealth) {
        if let Some(registry) = &self.health {
            registry.report(components::CONFIG, health).await;
        }
    }

    /// Poll both sources on their configured periodicities until shutdown
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        // Remember what is loaded so the first poll does not re-swap it
        if let Ok(text) = std::fs::read_to_string(&self.path) {
            *self.last_text.lock() = Some(text);
        }

        let conf = self.handle.load();
        let mut conf_ticker = interval(conf.rca_check_period());
        let mut threshold_ticker = interval(conf.threshold_check_period());
        conf_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        threshold_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(path = %self.path.display(), "Starting configuration reloader");

        loop {
            tokio::select! {
                _ = conf_ticker.tick() => {
                    self.poll_conf().await;
                }
                _ = threshold_ticker.tick() => {
                    self.poll_thresholds().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down configuration reloader");
                    break;
                }
            }
        }
    }
}
