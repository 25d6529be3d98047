//! Durable record of the latest decision.
//!
//! The persisted file is a TOML document with a `decision` section plus
//! optional `inputs`, `health`, `performance` and `circuit_breaker` sections.
//! Unknown top-level keys survive a read-modify-write cycle.

use crate::error::StateError;
use crate::utils::fs::write_atomic;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// The latest decision as persisted in the `decision` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionState {
    pub last_decision: String,
    pub confidence_score: f64,
    pub justification: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Parse an ISO-8601 timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|_| format!("invalid ISO-8601 timestamp '{raw}'"))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

impl DecisionState {
    pub fn new(
        last_decision: impl Into<String>,
        confidence_score: f64,
        justification: impl Into<String>,
    ) -> Self {
        Self {
            last_decision: last_decision.into(),
            confidence_score,
            justification: justification.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if !self.confidence_score.is_finite() || !(0.0..=1.0).contains(&self.confidence_score) {
            return Err(StateError::Invalid(format!(
                "confidence_score must be within [0, 1], got {}",
                self.confidence_score
            )));
        }
        if self.last_decision.trim().is_empty() {
            return Err(StateError::Invalid("last_decision is empty".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSection {
    pub is_healthy: bool,
    pub error_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSection {
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitSection {
    pub state: String,
}

/// Whole persisted state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<DecisionState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<toml::Table>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub performance: Option<PerformanceSection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitSection>,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl StateDocument {
    /// Parse a state document, rejecting empty input.
    pub fn parse(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Err("file is empty".into());
        }
        toml::from_str(raw).map_err(|e| e.to_string())
    }

    pub fn render(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }
}

/// File-backed store for [`StateDocument`].
///
/// Writes are serialised through an internal mutex and land via
/// temp-file + rename; reads never take the lock.
pub struct StateStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the latest decision. Missing file, empty file, parse failure and
    /// a missing `decision` section are all reported as corruption.
    pub fn load(&self) -> Result<DecisionState, StateError> {
        self.load_document()?
            .decision
            .ok_or_else(|| StateError::corrupt(&self.path, "missing [decision] section"))
    }

    pub fn load_document(&self) -> Result<StateDocument, StateError> {
        let raw = fs::read_to_string(&self.path).map_err(|error| {
            let reason = if error.kind() == io::ErrorKind::NotFound {
                "file not found".to_string()
            } else {
                error.to_string()
            };
            StateError::corrupt(&self.path, reason)
        })?;
        StateDocument::parse(&raw).map_err(|reason| StateError::corrupt(&self.path, reason))
    }

    /// Persist `state` into the `decision` section, keeping every other section.
    pub fn save(&self, state: &DecisionState) -> Result<(), StateError> {
        let state = state.clone();
        self.update(move |doc| {
            doc.decision = Some(state);
        })
    }

    /// Read-modify-write the whole document under the write lock.
    ///
    /// A corrupt or missing file starts from an empty document. The decision
    /// timestamp may never move backwards.
    pub fn update<F>(&self, apply: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut StateDocument),
    {
        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut document = match self.load_document() {
            Ok(document) => document,
            Err(error) => {
                tracing::debug!(%error, "starting state document from scratch");
                StateDocument::default()
            }
        };
        let previous = document.decision.as_ref().map(|d| d.timestamp);

        apply(&mut document);

        if let Some(decision) = &document.decision {
            decision.validate()?;
            if let Some(previous) = previous
                && decision.timestamp < previous
            {
                return Err(StateError::Regression {
                    previous: previous.to_rfc3339(),
                    attempted: decision.timestamp.to_rfc3339(),
                });
            }
        }

        self.write_document_locked(&document)
    }

    fn write_document_locked(&self, document: &StateDocument) -> Result<(), StateError> {
        let rendered = document.render().map_err(StateError::Invalid)?;
        write_atomic(&self.path, rendered.as_bytes()).map_err(|source| {
            StateError::WriteFailure {
                path: self.path.clone(),
                source,
            }
        })?;
        tracing::debug!(path = %self.path.display(), "state persisted");
        Ok(())
    }
}
