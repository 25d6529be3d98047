//! Startup guard and repair tool for the persisted decision state.
//!
//! Backups are byte-identical copies of a previously valid state file, named
//! `<state stem>_<utc timestamp>.toml` inside the backup directory. Restores
//! always pick the newest backup that still validates.

use crate::config::Config;
use crate::error::FailsafeError;
use crate::state::StateDocument;
use crate::utils::fs::{
    append_line, copy_atomic, list_timestamped, prune_timestamped, timestamped_path,
};
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const BACKUP_EXT: &str = "toml";
const ROLLBACK_ARCHIVE_DIR: &str = "rollback";

/// Result of checking the live state file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailsafeOutcome {
    /// Live state loads and validates.
    Valid,
    /// Live state was broken and has been replaced by this backup.
    Restored { from: PathBuf },
    /// No state file and no backups: first start.
    Fresh,
    /// Broken state and no usable backup; the loop must not start.
    Unrecoverable { reason: String },
}

impl FailsafeOutcome {
    pub fn allows_start(&self) -> bool {
        !matches!(self, Self::Unrecoverable { .. })
    }
}

pub struct FailsafeManager {
    state_file: PathBuf,
    backup_dir: PathBuf,
    failure_log: PathBuf,
    keep: usize,
}

impl FailsafeManager {
    pub fn new(
        state_file: impl Into<PathBuf>,
        backup_dir: impl Into<PathBuf>,
        failure_log: impl Into<PathBuf>,
        keep: usize,
    ) -> Self {
        Self {
            state_file: state_file.into(),
            backup_dir: backup_dir.into(),
            failure_log: failure_log.into(),
            keep: keep.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.state_file(),
            config.backup_dir(),
            config.failure_log(),
            config.backup.keep,
        )
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    fn backup_stem(&self) -> String {
        self.state_file
            .file_stem()
            .map_or_else(|| "state".into(), |s| s.to_string_lossy().into_owned())
    }

    /// Check the live state and repair it from backups if needed.
    pub fn inspect(&self) -> Result<FailsafeOutcome, FailsafeError> {
        let reason = match validate_state_file(&self.state_file) {
            Ok(()) => {
                tracing::debug!(path = %self.state_file.display(), "state file valid");
                return Ok(FailsafeOutcome::Valid);
            }
            Err(reason) => reason,
        };

        if !self.state_file.exists() && self.list_backups()?.is_empty() {
            tracing::info!(path = %self.state_file.display(), "no state and no backups; fresh start");
            return Ok(FailsafeOutcome::Fresh);
        }

        tracing::warn!(path = %self.state_file.display(), %reason, "state file invalid; restoring");
        match self.restore_from_backup(&reason)? {
            Some(from) => Ok(FailsafeOutcome::Restored { from }),
            None => Ok(FailsafeOutcome::Unrecoverable { reason }),
        }
    }

    /// `true` when a valid state is established (already valid or restored).
    pub fn activate(&self) -> bool {
        match self.inspect() {
            Ok(FailsafeOutcome::Valid | FailsafeOutcome::Restored { .. }) => true,
            Ok(FailsafeOutcome::Fresh) => {
                tracing::warn!("failsafe: no state file and no backup to restore");
                false
            }
            Ok(FailsafeOutcome::Unrecoverable { reason }) => {
                tracing::error!(%reason, "failsafe: state unrecoverable; manual restart required");
                false
            }
            Err(error) => {
                tracing::error!(%error, "failsafe activation failed");
                false
            }
        }
    }

    /// Copy the newest valid backup over the live state file, logging the
    /// incident. `Ok(None)` when no valid backup exists.
    pub fn restore_from_backup(&self, reason: &str) -> Result<Option<PathBuf>, FailsafeError> {
        for backup in self.list_backups()?.into_iter().rev() {
            if let Err(invalid) = validate_state_file(&backup) {
                tracing::warn!(backup = %backup.display(), reason = %invalid, "skipping invalid backup");
                continue;
            }
            copy_atomic(&backup, &self.state_file).map_err(|source| FailsafeError::Io {
                path: self.state_file.clone(),
                source,
            })?;
            tracing::info!(backup = %backup.display(), "state restored from backup");
            self.log_incident(
                "State restored from backup",
                reason,
                &format!("restored `{}`", backup.display()),
            );
            return Ok(Some(backup));
        }

        self.log_incident(
            "State restore failed",
            reason,
            "no valid backup available; manual restart required",
        );
        Ok(None)
    }

    /// Time-stamped, byte-identical copy of the live state. Skipped (`None`)
    /// when the live state does not validate.
    pub fn create_backup(&self) -> Result<Option<PathBuf>, FailsafeError> {
        if let Err(reason) = validate_state_file(&self.state_file) {
            tracing::debug!(%reason, "not backing up invalid state");
            return Ok(None);
        }
        let target = timestamped_path(&self.backup_dir, &self.backup_stem(), BACKUP_EXT);
        copy_atomic(&self.state_file, &target).map_err(|source| FailsafeError::Io {
            path: target.clone(),
            source,
        })?;
        let pruned = prune_timestamped(&self.backup_dir, &self.backup_stem(), BACKUP_EXT, self.keep)
            .map_err(|source| FailsafeError::Io {
                path: self.backup_dir.clone(),
                source,
            })?;
        tracing::debug!(backup = %target.display(), pruned, "state backup created");
        Ok(Some(target))
    }

    /// Archive the live file, then restore the newest valid backup that
    /// differs from it.
    pub fn rollback(&self) -> Result<Option<PathBuf>, FailsafeError> {
        let current = match fs::read(&self.state_file) {
            Ok(bytes) => Some(bytes),
            Err(error) if error.kind() == io::ErrorKind::NotFound => None,
            Err(source) => {
                return Err(FailsafeError::Io {
                    path: self.state_file.clone(),
                    source,
                });
            }
        };

        let candidate = self
            .list_backups()?
            .into_iter()
            .rev()
            .filter(|backup| validate_state_file(backup).is_ok())
            .find(|backup| fs::read(backup).ok() != current);
        let Some(backup) = candidate else {
            tracing::warn!("rollback: no earlier valid backup");
            return Ok(None);
        };

        if current.is_some() {
            let archive_dir = self.backup_dir.join(ROLLBACK_ARCHIVE_DIR);
            let archived = timestamped_path(&archive_dir, &self.backup_stem(), BACKUP_EXT);
            copy_atomic(&self.state_file, &archived).map_err(|source| FailsafeError::Io {
                path: archived.clone(),
                source,
            })?;
            tracing::info!(archived = %archived.display(), "live state archived before rollback");
        }

        copy_atomic(&backup, &self.state_file).map_err(|source| FailsafeError::Io {
            path: self.state_file.clone(),
            source,
        })?;
        self.log_incident(
            "Manual rollback",
            "operator requested rollback",
            &format!("restored `{}`", backup.display()),
        );
        Ok(Some(backup))
    }

    /// Backups oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, FailsafeError> {
        list_timestamped(&self.backup_dir, &self.backup_stem(), BACKUP_EXT).map_err(|source| {
            FailsafeError::Io {
                path: self.backup_dir.clone(),
                source,
            }
        })
    }

    fn log_incident(&self, title: &str, reason: &str, action: &str) {
        let block = format!(
            "\n## {} — {title}\n\n- **Reason:** {reason}\n- **Action:** {action}\n",
            Utc::now().to_rfc3339()
        );
        if let Err(error) = append_line(&self.failure_log, &block) {
            tracing::warn!(path = %self.failure_log.display(), %error, "failure log append failed");
        }
    }
}

/// Ok when the file parses, has a `decision` section and that section is sane.
pub fn validate_state_file(path: &Path) -> Result<(), String> {
    let raw = fs::read_to_string(path).map_err(|error| match error.kind() {
        io::ErrorKind::NotFound => "file not found".to_string(),
        _ => error.to_string(),
    })?;
    let document = StateDocument::parse(&raw)?;
    let decision = document
        .decision
        .ok_or_else(|| "missing [decision] section".to_string())?;
    decision.validate().map_err(|e| e.to_string())
}
