//! Validated point-in-time snapshots of the state file.
//!
//! A snapshot keeps only the `inputs` and `decision` sections of the state,
//! plus two timestamps. Each snapshot is archived in the history directory and
//! then atomically published at the configured output path.

use crate::config::{Config, FailsafeMode};
use crate::error::{FailsafeError, SnapshotError};
use crate::failsafe::FailsafeManager;
use crate::utils::fs::{append_line, prune_timestamped, timestamped_path, write_atomic};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const HISTORY_STEM: &str = "snapshot";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<toml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<toml::Value>,
    pub timestamp: String,
    pub snapshot_time: String,
}

impl Snapshot {
    /// Build from a parsed state table. Every other section is dropped.
    pub fn from_state(state: &toml::Table, now: DateTime<Utc>) -> Self {
        let inputs = state.get("inputs").cloned();
        let decision = state.get("decision").cloned();
        let timestamp = state
            .get("timestamp")
            .or_else(|| decision.as_ref().and_then(|d| d.get("timestamp")))
            .map(|value| match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| now.to_rfc3339());

        Self {
            inputs,
            decision,
            timestamp,
            snapshot_time: now.to_rfc3339(),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn confidence(&self) -> Option<f64> {
        let value = self.decision.as_ref()?.get("confidence_score")?;
        value
            .as_float()
            .or_else(|| value.as_integer().map(|i| i as f64))
    }

    /// Serialize, parse back and require equality.
    pub fn render_validated(&self) -> Result<String, SnapshotError> {
        let rendered =
            toml::to_string_pretty(self).map_err(|e| SnapshotError::Validation(e.to_string()))?;
        let reparsed: Self =
            toml::from_str(&rendered).map_err(|e| SnapshotError::Validation(e.to_string()))?;
        if &reparsed != self {
            return Err(SnapshotError::Validation(
                "snapshot does not survive a serialize/parse round trip".into(),
            ));
        }
        Ok(rendered)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotReport {
    pub output: PathBuf,
    pub archived: PathBuf,
    pub snapshot: Snapshot,
}

/// What to run when snapshot generation fails and fallback is requested.
pub enum FailsafeHook {
    InProcess(Arc<FailsafeManager>),
    /// Run an external command (normally `loopguard failsafe`) with a wall-clock bound.
    Subprocess {
        program: PathBuf,
        args: Vec<String>,
        timeout: Duration,
    },
    Disabled,
}

impl FailsafeHook {
    pub fn from_config(config: &Config, manager: Arc<FailsafeManager>) -> Self {
        match config.snapshot.failsafe_mode {
            FailsafeMode::InProcess => Self::InProcess(manager),
            FailsafeMode::Subprocess => {
                let program = std::env::current_exe().unwrap_or_else(|_| "loopguard".into());
                Self::Subprocess {
                    program,
                    args: vec![
                        "--config".into(),
                        config.config_path.display().to_string(),
                        "failsafe".into(),
                    ],
                    timeout: Duration::from_secs(config.snapshot.failsafe_timeout_secs),
                }
            }
            FailsafeMode::Disabled => Self::Disabled,
        }
    }

    /// `Ok(true)` when the failsafe established a valid state.
    pub async fn run(&self) -> Result<bool, FailsafeError> {
        match self {
            Self::InProcess(manager) => Ok(manager.activate()),
            Self::Subprocess {
                program,
                args,
                timeout,
            } => {
                let mut command = tokio::process::Command::new(program);
                command.args(args).kill_on_drop(true);
                let status = tokio::time::timeout(*timeout, command.status())
                    .await
                    .map_err(|_| FailsafeError::TimedOut(*timeout))?
                    .map_err(|e| FailsafeError::Subprocess(e.to_string()))?;
                if status.success() {
                    Ok(true)
                } else {
                    Err(FailsafeError::Subprocess(format!(
                        "{} exited with {status}",
                        program.display()
                    )))
                }
            }
            Self::Disabled => Ok(false),
        }
    }
}

pub struct SnapshotManager {
    state_file: PathBuf,
    output: PathBuf,
    history_dir: PathBuf,
    history_keep: usize,
    evolution_log: PathBuf,
    hook: FailsafeHook,
    last_snapshot: Mutex<Option<DateTime<Utc>>>,
}

impl SnapshotManager {
    pub fn new(
        state_file: impl Into<PathBuf>,
        output: impl Into<PathBuf>,
        history_dir: impl Into<PathBuf>,
        evolution_log: impl Into<PathBuf>,
        hook: FailsafeHook,
    ) -> Self {
        Self {
            state_file: state_file.into(),
            output: output.into(),
            history_dir: history_dir.into(),
            history_keep: 20,
            evolution_log: evolution_log.into(),
            hook,
            last_snapshot: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config, hook: FailsafeHook) -> Self {
        Self::new(
            config.state_file(),
            config.snapshot_file(),
            config.snapshot_history_dir(),
            config.evolution_log(),
            hook,
        )
        .with_history_keep(config.snapshot.history_keep)
    }

    pub fn with_history_keep(mut self, keep: usize) -> Self {
        self.history_keep = keep.max(1);
        self
    }

    pub fn last_snapshot_time(&self) -> Option<DateTime<Utc>> {
        *self
            .last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a snapshot; on failure run the failsafe hook when `fallback`
    /// is set. Returns whether a snapshot was written.
    pub async fn generate(
        &self,
        input: Option<&Path>,
        output: Option<&Path>,
        fallback: bool,
    ) -> bool {
        match self.generate_detailed(input, output) {
            Ok(_) => true,
            Err(error) => {
                tracing::warn!(%error, "snapshot generation failed");
                if fallback {
                    match self.run_failsafe().await {
                        Ok(established) => {
                            tracing::info!(established, "failsafe hook completed");
                        }
                        Err(error) => tracing::error!(%error, "failsafe hook failed"),
                    }
                }
                false
            }
        }
    }

    pub async fn run_failsafe(&self) -> Result<bool, FailsafeError> {
        tracing::warn!("running failsafe after snapshot failure");
        self.hook.run().await
    }

    /// Generate without the fallback. Nothing is written unless validation passes.
    pub fn generate_detailed(
        &self,
        input: Option<&Path>,
        output: Option<&Path>,
    ) -> Result<SnapshotReport, SnapshotError> {
        let input = input.unwrap_or(&self.state_file);
        let output = output.unwrap_or(&self.output);
        if same_file(output, &self.state_file) || same_file(output, input) {
            return Err(SnapshotError::OverwritesState(output.to_path_buf()));
        }

        let state = load_state_table(input);
        let snapshot = Snapshot::from_state(&state, Utc::now());
        let rendered = snapshot.render_validated()?;

        let archived = timestamped_path(&self.history_dir, HISTORY_STEM, "toml");
        write_atomic(&archived, rendered.as_bytes()).map_err(|source| SnapshotError::Write {
            path: archived.clone(),
            source,
        })?;
        write_atomic(output, rendered.as_bytes()).map_err(|source| SnapshotError::Write {
            path: output.to_path_buf(),
            source,
        })?;
        if let Err(error) =
            prune_timestamped(&self.history_dir, HISTORY_STEM, "toml", self.history_keep)
        {
            tracing::warn!(dir = %self.history_dir.display(), %error, "snapshot history prune failed");
        }

        let score = snapshot
            .confidence()
            .map_or_else(|| "N/A".to_string(), |c| c.to_string());
        if let Err(error) = append_line(
            &self.evolution_log,
            &format!("{} :: Score: {score}", snapshot.timestamp),
        ) {
            tracing::warn!(path = %self.evolution_log.display(), %error, "evolution log append failed");
        }

        *self
            .last_snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        tracing::info!(output = %output.display(), "snapshot written");

        Ok(SnapshotReport {
            output: output.to_path_buf(),
            archived,
            snapshot,
        })
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Missing or unreadable input is an empty state, not a failure.
fn load_state_table(path: &Path) -> toml::Table {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "snapshot input unreadable; using empty state");
            return toml::Table::new();
        }
    };
    toml::from_str(&raw).unwrap_or_else(|error| {
        tracing::warn!(path = %path.display(), %error, "snapshot input unparseable; using empty state");
        toml::Table::new()
    })
}
