use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::recovery::ErrorType;

// ─── Top-level error hierarchy ───────────────────────────────────────────────

/// Structured error hierarchy for the kernel.
///
/// Each subsystem defines its own error variant. Callers of [`crate::Kernel`]
/// match on these to decide how to react; binary-facing code continues to use
/// `anyhow::Result` for ad-hoc context chains.
#[derive(Debug, Error)]
pub enum KernelError {
    // ── Config ───────────────────────────────────────────────────────────
    #[error("config: {0}")]
    Config(#[from] ConfigError),

    // ── State store ─────────────────────────────────────────────────────
    #[error("state: {0}")]
    State(#[from] StateError),

    // ── Circuit breaker ─────────────────────────────────────────────────
    #[error("circuit open: decision calls short-circuited (retry in {retry_in:?})")]
    CircuitOpen { retry_in: Duration },

    // ── Decision function ───────────────────────────────────────────────
    #[error("decision: {0}")]
    Decision(#[from] DecisionError),

    // ── Recovery ────────────────────────────────────────────────────────
    #[error("recovery fatal ({error_type}): {reason}; restart from failsafe-verified state")]
    RecoveryFatal { error_type: ErrorType, reason: String },

    // ── Snapshot ────────────────────────────────────────────────────────
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),

    // ── Failsafe ────────────────────────────────────────────────────────
    #[error("failsafe: {0}")]
    Failsafe(#[from] FailsafeError),

    // ── Generic fallthrough (wraps anyhow for interop) ──────────────────
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Config errors ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

// ─── State store errors ──────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state corrupt at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("write to {path} failed: {source}")]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("timestamp regression: stored {previous}, attempted {attempted}")]
    Regression { previous: String, attempted: String },

    #[error("invalid decision state: {0}")]
    Invalid(String),
}

impl StateError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

// ─── Decision function errors ────────────────────────────────────────────────

/// Failures surfaced by a decision function.
///
/// Everything except [`DecisionError::Unexpected`] belongs to the domain
/// taxonomy and counts towards the circuit breaker threshold.
#[derive(Debug, Clone, Error)]
pub enum DecisionError {
    #[error("cognitive overload: {0}")]
    CognitiveOverload(String),

    #[error("decision integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("system reboot required: {0}")]
    RebootRequired(String),

    #[error("decision timed out after {0:?}")]
    TimedOut(Duration),

    #[error("decision failed: {0}")]
    Failed(String),

    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl DecisionError {
    pub fn is_domain(&self) -> bool {
        !matches!(self, Self::Unexpected(_))
    }
}

// ─── Snapshot errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot validation failed: {0}")]
    Validation(String),

    #[error("snapshot write to {path} failed: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot output {0} is the live state file")]
    OverwritesState(PathBuf),
}

// ─── Failsafe errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FailsafeError {
    #[error("backup io on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failsafe subprocess timed out after {0:?}")]
    TimedOut(Duration),

    #[error("failsafe subprocess failed: {0}")]
    Subprocess(String),
}

// ─── Convenience re-exports ─────────────────────────────────────────────────

/// Shorthand result type for the crate.
pub type Result<T> = std::result::Result<T, KernelError>;
