//! Failure classification and recovery bookkeeping.
//!
//! [`ErrorRecovery`] maps every failure to an [`ErrorType`], derives a
//! [`Severity`] and a [`Strategy`], and records the [`Outcome`] of each
//! attempt. Executing the strategy (sleeping, re-invoking the decision
//! function, serving a fallback) is the kernel's job.

mod degradation;

pub use degradation::{DegradationController, DegradationStatus, Mode};

use crate::config::RecoveryConfig;
use crate::error::{DecisionError, FailsafeError, SnapshotError, StateError};
use crate::events::{EventStore, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const ATTEMPT_HISTORY: usize = 100;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ErrorType {
    CognitiveOverload,
    DecisionIntegrity,
    RebootRequired,
    TimedOut,
    /// A known domain failure without a more specific category.
    DecisionFailure,
    StateWrite,
    StateCorrupt,
    SnapshotFailure,
    FailsafeTimeout,
    Unexpected,
}

impl ErrorType {
    pub fn default_severity(self) -> Severity {
        match self {
            Self::SnapshotFailure => Severity::Low,
            Self::TimedOut | Self::DecisionFailure | Self::StateWrite => Severity::Medium,
            Self::CognitiveOverload | Self::StateCorrupt => Severity::High,
            Self::DecisionIntegrity
            | Self::RebootRequired
            | Self::FailsafeTimeout
            | Self::Unexpected => Severity::Critical,
        }
    }
}

impl From<&DecisionError> for ErrorType {
    fn from(error: &DecisionError) -> Self {
        match error {
            DecisionError::CognitiveOverload(_) => Self::CognitiveOverload,
            DecisionError::IntegrityViolation(_) => Self::DecisionIntegrity,
            DecisionError::RebootRequired(_) => Self::RebootRequired,
            DecisionError::TimedOut(_) => Self::TimedOut,
            DecisionError::Failed(_) => Self::DecisionFailure,
            DecisionError::Unexpected(_) => Self::Unexpected,
        }
    }
}

impl From<&StateError> for ErrorType {
    fn from(error: &StateError) -> Self {
        match error {
            StateError::Corrupt { .. } => Self::StateCorrupt,
            StateError::WriteFailure { .. } => Self::StateWrite,
            StateError::Regression { .. } | StateError::Invalid(_) => Self::DecisionIntegrity,
        }
    }
}

impl From<&SnapshotError> for ErrorType {
    fn from(_: &SnapshotError) -> Self {
        Self::SnapshotFailure
    }
}

impl From<&FailsafeError> for ErrorType {
    fn from(error: &FailsafeError) -> Self {
        match error {
            FailsafeError::TimedOut(_) => Self::FailsafeTimeout,
            FailsafeError::Io { .. } | FailsafeError::Subprocess(_) => Self::StateCorrupt,
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Strategy {
    Retry,
    Fallback,
    Degrade,
    RebootRequired,
}

impl Strategy {
    pub fn for_severity(severity: Severity, has_known_good: bool) -> Self {
        match severity {
            Severity::Low | Severity::Medium => Self::Retry,
            Severity::High if has_known_good => Self::Fallback,
            Severity::High => Self::Degrade,
            Severity::Critical => Self::RebootRequired,
        }
    }
}

/// Ordered from best to worst.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Recovered,
    Escalated,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub strategy: Strategy,
    pub outcome: Outcome,
    /// Retries consumed before this outcome.
    pub attempts: u32,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

/// What to do about a classified failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryPlan {
    pub error_type: ErrorType,
    pub severity: Severity,
    pub strategy: Strategy,
    pub max_retries: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub total_attempts: u64,
    pub recovered_count: u64,
    pub escalated_count: u64,
    pub fatal_count: u64,
    pub strategies_used: BTreeMap<String, u64>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl RecoveryMetrics {
    pub fn recovery_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.recovered_count as f64 / self.total_attempts as f64;
        rate
    }
}

#[derive(Default)]
struct Ledger {
    metrics: RecoveryMetrics,
    history: VecDeque<RecoveryAttempt>,
}

pub struct ErrorRecovery {
    overrides: HashMap<ErrorType, Severity>,
    max_retries: u32,
    base_backoff: Duration,
    max_backoff: Duration,
    ledger: Mutex<Ledger>,
    events: Arc<EventStore>,
}

impl ErrorRecovery {
    pub fn new(config: &RecoveryConfig, events: Arc<EventStore>) -> Self {
        Self {
            overrides: parse_overrides(&config.severity_overrides),
            max_retries: config.max_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            ledger: Mutex::new(Ledger::default()),
            events,
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn classify(&self, error_type: ErrorType) -> Severity {
        self.overrides
            .get(&error_type)
            .copied()
            .unwrap_or_else(|| error_type.default_severity())
    }

    pub fn plan(&self, error_type: ErrorType, has_known_good: bool) -> RecoveryPlan {
        let severity = self.classify(error_type);
        RecoveryPlan {
            error_type,
            severity,
            strategy: Strategy::for_severity(severity, has_known_good),
            max_retries: self.max_retries,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Record one attempt: metrics, bounded history and a `RECOVERY` event.
    pub fn record(
        &self,
        plan: &RecoveryPlan,
        outcome: Outcome,
        attempts: u32,
        detail: impl Into<String>,
    ) -> RecoveryAttempt {
        let attempt = RecoveryAttempt {
            error_type: plan.error_type,
            severity: plan.severity,
            strategy: plan.strategy,
            outcome,
            attempts,
            detail: detail.into(),
            timestamp: Utc::now(),
        };

        {
            let mut ledger = self.ledger();
            let metrics = &mut ledger.metrics;
            metrics.total_attempts += 1;
            match outcome {
                Outcome::Recovered => metrics.recovered_count += 1,
                Outcome::Escalated => metrics.escalated_count += 1,
                Outcome::Fatal => metrics.fatal_count += 1,
            }
            *metrics
                .strategies_used
                .entry(attempt.strategy.to_string())
                .or_default() += 1;
            metrics.last_attempt_at = Some(attempt.timestamp);

            ledger.history.push_back(attempt.clone());
            while ledger.history.len() > ATTEMPT_HISTORY {
                ledger.history.pop_front();
            }
        }

        match outcome {
            Outcome::Recovered => tracing::info!(
                error_type = %attempt.error_type,
                strategy = %attempt.strategy,
                attempts,
                "recovered from failure"
            ),
            Outcome::Escalated => tracing::warn!(
                error_type = %attempt.error_type,
                severity = %attempt.severity,
                strategy = %attempt.strategy,
                detail = %attempt.detail,
                "recovery escalated"
            ),
            Outcome::Fatal => tracing::error!(
                error_type = %attempt.error_type,
                detail = %attempt.detail,
                "unrecoverable failure; restart required"
            ),
        }

        let payload = serde_json::to_value(&attempt).unwrap_or_default();
        self.events.append(EventType::Recovery, "recovery", payload);
        attempt
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        self.ledger().metrics.clone()
    }

    /// Most recent attempts, oldest first.
    pub fn recent_attempts(&self, n: usize) -> Vec<RecoveryAttempt> {
        let ledger = self.ledger();
        let skip = ledger.history.len().saturating_sub(n);
        ledger.history.iter().skip(skip).cloned().collect()
    }
}

/// Unknown error types are ignored; unparseable severities fail closed.
fn parse_overrides(raw: &BTreeMap<String, String>) -> HashMap<ErrorType, Severity> {
    let mut overrides = HashMap::new();
    for (key, value) in raw {
        let Ok(error_type) = ErrorType::from_str(key) else {
            tracing::warn!(error_type = %key, "ignoring severity override for unknown error type");
            continue;
        };
        let severity = Severity::from_str(value).unwrap_or_else(|_| {
            tracing::warn!(
                error_type = %key,
                severity = %value,
                "unparseable severity override; treating as CRITICAL"
            );
            Severity::Critical
        });
        overrides.insert(error_type, severity);
    }
    overrides
}
