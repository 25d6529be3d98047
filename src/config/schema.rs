use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from the config location, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed at load time, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default, rename = "loop")]
    pub decision_loop: LoopConfig,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub events: EventsConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub degradation: DegradationConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_dir: PathBuf::from("."),
            config_path: PathBuf::from("config.toml"),
            paths: PathsConfig::default(),
            decision_loop: LoopConfig::default(),
            circuit: CircuitConfig::default(),
            events: EventsConfig::default(),
            recovery: RecoveryConfig::default(),
            degradation: DegradationConfig::default(),
            snapshot: SnapshotConfig::default(),
            backup: BackupConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl Config {
    /// Resolve a configured path against the workspace directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace_dir.join(path)
        }
    }

    pub fn state_file(&self) -> PathBuf {
        self.resolve(&self.paths.state_file)
    }

    pub fn snapshot_file(&self) -> PathBuf {
        self.resolve(&self.paths.snapshot_file)
    }

    pub fn snapshot_history_dir(&self) -> PathBuf {
        self.resolve(&self.paths.snapshot_history_dir)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.resolve(&self.paths.backup_dir)
    }

    pub fn evolution_log(&self) -> PathBuf {
        self.resolve(&self.paths.evolution_log)
    }

    pub fn failure_log(&self) -> PathBuf {
        self.resolve(&self.paths.failure_log)
    }

    pub fn events_file(&self) -> PathBuf {
        self.resolve(&self.paths.events_file)
    }

    pub fn thresholds_file(&self) -> PathBuf {
        self.resolve(&self.paths.thresholds_file)
    }

    pub fn status_file(&self) -> PathBuf {
        self.resolve(&self.paths.status_file)
    }

    pub fn context_file(&self) -> PathBuf {
        self.resolve(&self.paths.context_file)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit.failure_threshold == 0 {
            return Err(ConfigError::Validation(
                "circuit.failure_threshold must be at least 1".into(),
            ));
        }
        if self.circuit.call_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "circuit.call_timeout_secs must be at least 1".into(),
            ));
        }
        if self.events.max_events == 0 || self.events.max_bytes == 0 {
            return Err(ConfigError::Validation(
                "events.max_events and events.max_bytes must be non-zero".into(),
            ));
        }
        if self.degradation.window == 0 {
            return Err(ConfigError::Validation(
                "degradation.window must be at least 1".into(),
            ));
        }
        if !(self.degradation.escalation_ratio > 0.0 && self.degradation.escalation_ratio <= 1.0) {
            return Err(ConfigError::Validation(format!(
                "degradation.escalation_ratio must be in (0, 1], got {}",
                self.degradation.escalation_ratio
            )));
        }
        if !(0.0..=1.0).contains(&self.degradation.confidence_cap) {
            return Err(ConfigError::Validation(format!(
                "degradation.confidence_cap must be in [0, 1], got {}",
                self.degradation.confidence_cap
            )));
        }
        if self.recovery.max_backoff_ms < self.recovery.base_backoff_ms {
            return Err(ConfigError::Validation(
                "recovery.max_backoff_ms must not be below recovery.base_backoff_ms".into(),
            ));
        }
        if self.decision_loop.tick_secs == 0 {
            return Err(ConfigError::Validation(
                "loop.tick_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_snapshot_file")]
    pub snapshot_file: PathBuf,
    #[serde(default = "default_snapshot_history_dir")]
    pub snapshot_history_dir: PathBuf,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_evolution_log")]
    pub evolution_log: PathBuf,
    #[serde(default = "default_failure_log")]
    pub failure_log: PathBuf,
    #[serde(default = "default_events_file")]
    pub events_file: PathBuf,
    #[serde(default = "default_thresholds_file")]
    pub thresholds_file: PathBuf,
    #[serde(default = "default_status_file")]
    pub status_file: PathBuf,
    #[serde(default = "default_context_file")]
    pub context_file: PathBuf,
}

fn default_state_file() -> PathBuf {
    PathBuf::from("state/decision_state.toml")
}

fn default_snapshot_file() -> PathBuf {
    PathBuf::from("state/decision_snapshot.toml")
}

fn default_snapshot_history_dir() -> PathBuf {
    PathBuf::from("state/snapshots")
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

fn default_evolution_log() -> PathBuf {
    PathBuf::from("logs/evolution.log")
}

fn default_failure_log() -> PathBuf {
    PathBuf::from("logs/failure_analysis.md")
}

fn default_events_file() -> PathBuf {
    PathBuf::from("state/events.jsonl")
}

fn default_thresholds_file() -> PathBuf {
    PathBuf::from("state/thresholds.toml")
}

fn default_status_file() -> PathBuf {
    PathBuf::from("state/status.json")
}

fn default_context_file() -> PathBuf {
    PathBuf::from("state/context.toml")
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            snapshot_file: default_snapshot_file(),
            snapshot_history_dir: default_snapshot_history_dir(),
            backup_dir: default_backup_dir(),
            evolution_log: default_evolution_log(),
            failure_log: default_failure_log(),
            events_file: default_events_file(),
            thresholds_file: default_thresholds_file(),
            status_file: default_status_file(),
            context_file: default_context_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Dotted path into the context naming a peer system's decision. A
    /// mismatch with ours is recorded as a contradiction.
    #[serde(default = "default_peer_decision_key")]
    pub peer_decision_key: String,
}

fn default_tick_secs() -> u64 {
    5
}

fn default_peer_decision_key() -> String {
    "peer.last_decision".into()
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            peer_decision_key: default_peer_decision_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_true")]
    pub restore_from_events: bool,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            call_timeout_secs: default_call_timeout_secs(),
            restore_from_events: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_true")]
    pub persist: bool,
}

fn default_max_events() -> usize {
    10_000
}

fn default_max_bytes() -> usize {
    10_000_000
}

fn default_retention_days() -> u32 {
    30
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            max_events: default_max_events(),
            max_bytes: default_max_bytes(),
            retention_days: default_retention_days(),
            persist: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Per error type severity overrides, e.g. `timed_out = "high"`.
    #[serde(default)]
    pub severity_overrides: BTreeMap<String, String>,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            severity_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DegradationConfig {
    #[serde(default = "default_degradation_window")]
    pub window: usize,
    #[serde(default = "default_escalation_ratio")]
    pub escalation_ratio: f64,
    #[serde(default = "default_recover_after")]
    pub recover_after: u32,
    #[serde(default = "default_confidence_cap")]
    pub confidence_cap: f64,
}

fn default_degradation_window() -> usize {
    10
}

fn default_escalation_ratio() -> f64 {
    0.5
}

fn default_recover_after() -> u32 {
    3
}

fn default_confidence_cap() -> f64 {
    0.5
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            window: default_degradation_window(),
            escalation_ratio: default_escalation_ratio(),
            recover_after: default_recover_after(),
            confidence_cap: default_confidence_cap(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailsafeMode {
    #[default]
    InProcess,
    Subprocess,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Generate a snapshot every N successful ticks (0 disables the cadence).
    #[serde(default = "default_snapshot_every_ticks")]
    pub every_ticks: u64,
    #[serde(default = "default_significant_decisions")]
    pub significant_decisions: Vec<String>,
    #[serde(default = "default_history_keep")]
    pub history_keep: usize,
    #[serde(default = "default_true")]
    pub fallback: bool,
    #[serde(default)]
    pub failsafe_mode: FailsafeMode,
    #[serde(default = "default_failsafe_timeout_secs")]
    pub failsafe_timeout_secs: u64,
}

fn default_snapshot_every_ticks() -> u64 {
    10
}

fn default_significant_decisions() -> Vec<String> {
    vec!["emergency_shutdown".into(), "reduce_load".into()]
}

fn default_history_keep() -> usize {
    20
}

fn default_failsafe_timeout_secs() -> u64 {
    30
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            every_ticks: default_snapshot_every_ticks(),
            significant_decisions: default_significant_decisions(),
            history_keep: default_history_keep(),
            fallback: true,
            failsafe_mode: FailsafeMode::default(),
            failsafe_timeout_secs: default_failsafe_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Back up the live state every N successful ticks (0 disables).
    #[serde(default = "default_backup_every_ticks")]
    pub every_ticks: u64,
    #[serde(default = "default_backup_keep")]
    pub keep: usize,
}

fn default_backup_every_ticks() -> u64 {
    10
}

fn default_backup_keep() -> usize {
    10
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            every_ticks: default_backup_every_ticks(),
            keep: default_backup_keep(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_anomaly_window_minutes")]
    pub anomaly_window_minutes: u64,
}

fn default_monitor_interval_secs() -> u64 {
    30
}

fn default_anomaly_window_minutes() -> u64 {
    60
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval_secs(),
            anomaly_window_minutes: default_anomaly_window_minutes(),
        }
    }
}
