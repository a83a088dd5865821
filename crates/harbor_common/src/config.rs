use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::HarborError;
use crate::types::{BackendStatus, NodeId};

/// Top-level control plane configuration (`harbor.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarborConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub sr_check: SrCheckConfig,
}

/// How the backends replicate among themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterMode {
    /// Primary plus streaming standbys. The only mode the lag monitor acts on.
    #[default]
    StreamingReplication,
    /// The proxy itself replicates writes to every backend.
    NativeReplication,
    /// No replication; backends are independent.
    Raw,
}

impl ClusterMode {
    pub fn is_streaming(self) -> bool {
        self == ClusterMode::StreamingReplication
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub mode: ClusterMode,
    /// Primary designated by upstream policy. `None` means no primary is
    /// currently reachable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_node: Option<NodeId>,
    /// Degenerate nodes the status verifier reports as invalid.
    pub detach_false_primary: bool,
    /// Re-read client access rules on configuration reload.
    pub enable_pool_hba: bool,
    pub pool_hba_file: String,
}

fn default_pool_hba_file() -> String {
    "pool_hba.conf".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            mode: ClusterMode::StreamingReplication,
            primary_node: None,
            detach_false_primary: false,
            enable_pool_hba: false,
            pool_hba_file: default_pool_hba_file(),
        }
    }
}

/// One `[[backends]]` entry. Position in the list is the node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Empty means a local socket connection (`localhost`).
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
    #[serde(default)]
    pub data_directory: String,
    /// Matched against `pg_stat_replication.application_name`.
    #[serde(default)]
    pub application_name: String,
    /// Status at configuration load.
    #[serde(default)]
    pub status: BackendStatus,
}

fn default_backend_port() -> u16 {
    5432
}

/// Online recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub user: String,
    #[serde(default)]
    pub password: String,
    /// Database used for the administrative and readiness connections.
    pub database: String,
    /// Script run by the recovery function during stage 1. Empty skips it.
    #[serde(default)]
    pub first_stage_command: String,
    /// Script run by the recovery function during stage 2. Empty skips it.
    #[serde(default)]
    pub second_stage_command: String,
    /// Server-side function that runs a copy script on the primary.
    pub recovery_function: String,
    /// Server-side function that starts the target's postmaster.
    pub remote_start_function: String,
    /// Interval between quiesce / readiness polls.
    pub poll_interval_secs: u64,
    /// Maximum number of quiesce / readiness polls.
    pub poll_attempts: u32,
}

impl RecoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: String::new(),
            database: "template1".to_string(),
            first_stage_command: String::new(),
            second_stage_command: String::new(),
            recovery_function: "pgpool_recovery".to_string(),
            remote_start_function: "pgpool_remote_start".to_string(),
            poll_interval_secs: 3,
            poll_attempts: 30,
        }
    }
}

/// When to emit the "replication is behind" log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStandbyDelay {
    None,
    /// Any nonzero lag.
    Always,
    /// Only lag above `delay_threshold` (and only if the threshold is set).
    #[default]
    IfOverThreshold,
}

/// Streaming replication check (lag monitor) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SrCheckConfig {
    /// Seconds between cycles. 0 disables lag and status checking.
    pub period_secs: u64,
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    pub log_standby_delay: LogStandbyDelay,
    /// Bytes of WAL. 0 disables threshold-based logging.
    #[serde(default)]
    pub delay_threshold: u64,
    /// Sleep used while checking is disabled.
    pub idle_sleep_secs: u64,
}

impl SrCheckConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_secs(self.idle_sleep_secs)
    }

    /// Whether a standby lagging by `lag` bytes should be logged.
    pub fn should_log_delay(&self, lag: u64) -> bool {
        match self.log_standby_delay {
            LogStandbyDelay::None => false,
            LogStandbyDelay::Always => lag > 0,
            LogStandbyDelay::IfOverThreshold => {
                self.delay_threshold > 0 && lag > self.delay_threshold
            }
        }
    }
}

impl Default for SrCheckConfig {
    fn default() -> Self {
        Self {
            period_secs: 10,
            user: "postgres".to_string(),
            password: String::new(),
            database: "postgres".to_string(),
            log_standby_delay: LogStandbyDelay::IfOverThreshold,
            delay_threshold: 0,
            idle_sleep_secs: 30,
        }
    }
}

impl HarborConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, HarborError> {
        toml::from_str(content).map_err(|e| HarborError::Config(e.to_string()))
    }

    /// Whether `other` describes a different set of backends. The backend
    /// directory is sized from this list, so a change needs a fresh one.
    pub fn backends_changed(&self, other: &HarborConfig) -> bool {
        self.backends != other.backends
    }

    /// Reject settings the control plane cannot act on.
    pub fn validate(&self) -> Result<(), String> {
        if self.backends.is_empty() {
            return Err("at least one [[backends]] entry is required".into());
        }

        let mut seen = HashSet::new();
        for (i, b) in self.backends.iter().enumerate() {
            if b.port == 0 {
                return Err(format!("backends[{}]: port must be nonzero", i));
            }
            if !seen.insert((b.hostname.as_str(), b.port)) {
                return Err(format!(
                    "backends[{}]: duplicate backend {}:{}",
                    i, b.hostname, b.port
                ));
            }
        }

        if let Some(primary) = self.cluster.primary_node {
            if primary.index() >= self.backends.len() {
                return Err(format!(
                    "cluster.primary_node {} is out of range ({} backends)",
                    primary,
                    self.backends.len()
                ));
            }
        }

        if self.recovery.poll_attempts == 0 {
            return Err("recovery.poll_attempts must be >= 1".into());
        }
        for (key, name) in [
            ("recovery.recovery_function", &self.recovery.recovery_function),
            ("recovery.remote_start_function", &self.recovery.remote_start_function),
        ] {
            if !is_sql_identifier(name) {
                return Err(format!("{} {:?} is not a plain SQL identifier", key, name));
            }
        }

        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, optionally schema-qualified once.
fn is_sql_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return false;
    }
    parts.iter().all(|p| {
        let mut chars = p.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// Where the control plane reads its configuration from. Consulted again
/// whenever a worker receives a reload request.
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Result<HarborConfig, HarborError>;
}

/// Reads and validates a TOML file on every `load()`.
#[derive(Debug, Clone)]
pub struct TomlFileSource {
    path: PathBuf,
}

impl TomlFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigSource for TomlFileSource {
    fn load(&self) -> Result<HarborConfig, HarborError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            HarborError::Config(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let config = HarborConfig::from_toml_str(&content)?;
        config
            .validate()
            .map_err(|e| HarborError::Config(format!("{}: {}", self.path.display(), e)))?;
        tracing::info!(path = %self.path.display(), "loaded config");
        Ok(config)
    }
}

/// A fixed configuration; reloads return the same value.
#[derive(Debug, Clone)]
pub struct StaticSource(pub HarborConfig);

impl ConfigSource for StaticSource {
    fn load(&self) -> Result<HarborConfig, HarborError> {
        Ok(self.0.clone())
    }
}
