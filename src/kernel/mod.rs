//! The resilience kernel: one protected decision per tick.
//!
//! [`Kernel::tick`] runs the decision function through the circuit breaker,
//! routes failures through [`ErrorRecovery`], persists the outcome and drives
//! snapshots, backups and the degradation window.

use crate::circuit::{CallError, CircuitBreaker, CircuitMetrics, CircuitState};
use crate::config::Config;
use crate::decision::{Decision, DecisionContext, DecisionFunction};
use crate::error::{DecisionError, KernelError, Result};
use crate::events::{EventStore, EventType};
use crate::failsafe::{FailsafeManager, FailsafeOutcome};
use crate::recovery::{
    DegradationController, DegradationStatus, ErrorRecovery, ErrorType, Outcome, RecoveryMetrics,
    Strategy,
};
use crate::snapshot::{FailsafeHook, SnapshotManager};
use crate::state::{CircuitSection, DecisionState, HealthSection, PerformanceSection, StateStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DecisionSource {
    /// First call succeeded.
    Primary,
    /// A retry succeeded.
    Retry,
    /// Last known-good decision served instead.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickOutcome {
    pub tick: u64,
    pub decision: String,
    pub confidence: f64,
    pub justification: String,
    pub source: DecisionSource,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub degraded_mode: bool,
    pub last_snapshot_time: Option<DateTime<Utc>>,
    pub level: HealthLevel,
    pub reboot_required: bool,
    pub ticks: u64,
    pub circuit: CircuitMetrics,
    pub recovery: RecoveryMetrics,
    pub degradation: DegradationStatus,
}

/// Cadences and keys copied out of the config at construction.
struct Schedule {
    snapshot_every: u64,
    significant_decisions: Vec<String>,
    snapshot_fallback: bool,
    backup_every: u64,
    peer_decision_key: String,
}

pub struct Kernel {
    decider: Arc<dyn DecisionFunction>,
    state: StateStore,
    events: Arc<EventStore>,
    breaker: CircuitBreaker,
    recovery: ErrorRecovery,
    degradation: DegradationController,
    snapshots: SnapshotManager,
    failsafe: Arc<FailsafeManager>,
    schedule: Schedule,
    ticks: AtomicU64,
    known_good: Mutex<Option<DecisionState>>,
    reboot: Mutex<Option<(ErrorType, String)>>,
}

impl Kernel {
    /// Wire every component from `config`, sharing `events` with the caller.
    pub fn new(config: &Config, decider: Arc<dyn DecisionFunction>, events: Arc<EventStore>) -> Self {
        let failsafe = Arc::new(FailsafeManager::from_config(config));
        let hook = FailsafeHook::from_config(config, Arc::clone(&failsafe));
        Self {
            decider,
            state: StateStore::new(config.state_file()),
            breaker: CircuitBreaker::new(&config.circuit, Arc::clone(&events)),
            recovery: ErrorRecovery::new(&config.recovery, Arc::clone(&events)),
            degradation: DegradationController::new(&config.degradation, Arc::clone(&events)),
            snapshots: SnapshotManager::from_config(config, hook),
            failsafe,
            schedule: Schedule {
                snapshot_every: config.snapshot.every_ticks,
                significant_decisions: config.snapshot.significant_decisions.clone(),
                snapshot_fallback: config.snapshot.fallback,
                backup_every: config.backup.every_ticks,
                peer_decision_key: config.decision_loop.peer_decision_key.clone(),
            },
            events,
            ticks: AtomicU64::new(0),
            known_good: Mutex::new(None),
            reboot: Mutex::new(None),
        }
    }

    /// Same as [`Kernel::new`] with the event store opened from `config`.
    pub fn from_config(config: &Config, decider: Arc<dyn DecisionFunction>) -> anyhow::Result<Self> {
        let events = EventStore::from_config(config).map_err(|e| {
            anyhow::anyhow!("failed to open event log {}: {e}", config.events_file().display())
        })?;
        Ok(Self::new(config, decider, Arc::new(events)))
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn recovery(&self) -> &ErrorRecovery {
        &self.recovery
    }

    pub fn degradation(&self) -> &DegradationController {
        &self.degradation
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    pub fn failsafe(&self) -> &FailsafeManager {
        &self.failsafe
    }

    fn known_good(&self) -> MutexGuard<'_, Option<DecisionState>> {
        self.known_good.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn reboot_flag(&self) -> MutexGuard<'_, Option<(ErrorType, String)>> {
        self.reboot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Verify (and if needed repair) the state file before the first tick.
    pub fn bootstrap(&self) -> Result<FailsafeOutcome> {
        let outcome = self.failsafe.inspect()?;
        match &outcome {
            FailsafeOutcome::Unrecoverable { reason } => {
                return Err(KernelError::RecoveryFatal {
                    error_type: ErrorType::StateCorrupt,
                    reason: reason.clone(),
                });
            }
            FailsafeOutcome::Fresh => {
                tracing::info!("starting without prior decision state");
            }
            FailsafeOutcome::Valid | FailsafeOutcome::Restored { .. } => {
                let state = self.state.load()?;
                tracing::info!(decision = %state.last_decision, "loaded known-good decision");
                *self.known_good() = Some(state);
            }
        }
        Ok(outcome)
    }

    /// One protected decision.
    ///
    /// Errors: [`KernelError::CircuitOpen`] when the breaker short-circuits,
    /// [`KernelError::RecoveryFatal`] once a reboot is required and
    /// [`KernelError::Decision`] when recovery could not produce a decision.
    pub async fn tick(&self, context: &DecisionContext) -> Result<TickOutcome> {
        if let Some((error_type, reason)) = self.reboot_flag().clone() {
            return Err(KernelError::RecoveryFatal { error_type, reason });
        }
        let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;

        match self.call_decider(context).await {
            Ok(decision) => {
                self.complete(tick, decision, DecisionSource::Primary, context)
                    .await
            }
            Err(CallError::Open { retry_in }) => Err(KernelError::CircuitOpen { retry_in }),
            Err(CallError::Failed(error)) => self.recover(tick, error, context).await,
        }
    }

    async fn call_decider(&self, context: &DecisionContext) -> std::result::Result<Decision, CallError> {
        let ceiling = self.degradation.confidence_ceiling();
        self.breaker
            .call_capped(self.decider.as_ref(), context, ceiling)
            .await
    }

    async fn recover(
        &self,
        tick: u64,
        mut error: DecisionError,
        context: &DecisionContext,
    ) -> Result<TickOutcome> {
        let mut attempts = 0u32;
        loop {
            let has_known_good = self.known_good().is_some();
            let plan = self.recovery.plan(ErrorType::from(&error), has_known_good);

            match plan.strategy {
                Strategy::Retry if attempts < plan.max_retries => {
                    attempts += 1;
                    tokio::time::sleep(self.recovery.backoff(attempts)).await;
                    match self.call_decider(context).await {
                        Ok(decision) => {
                            self.recovery.record(
                                &plan,
                                Outcome::Recovered,
                                attempts,
                                error.to_string(),
                            );
                            return self
                                .complete(tick, decision, DecisionSource::Retry, context)
                                .await;
                        }
                        Err(CallError::Open { .. }) => {
                            self.recovery.record(
                                &plan,
                                Outcome::Escalated,
                                attempts,
                                format!("circuit opened during retry: {error}"),
                            );
                            self.degradation.observe(Outcome::Escalated);
                            return self.fallback_or_fail(tick, error);
                        }
                        Err(CallError::Failed(next)) => error = next,
                    }
                }
                Strategy::Retry | Strategy::Fallback => {
                    self.recovery
                        .record(&plan, Outcome::Escalated, attempts, error.to_string());
                    self.degradation.observe(Outcome::Escalated);
                    return self.fallback_or_fail(tick, error);
                }
                Strategy::Degrade => {
                    self.recovery
                        .record(&plan, Outcome::Escalated, attempts, error.to_string());
                    self.degradation.observe(Outcome::Escalated);
                    self.degradation.enter_degraded("no_known_good_state");
                    return Err(KernelError::Decision(error));
                }
                Strategy::RebootRequired => {
                    self.recovery
                        .record(&plan, Outcome::Fatal, attempts, error.to_string());
                    self.degradation.observe(Outcome::Fatal);
                    return Err(self.require_reboot(plan.error_type, error.to_string()));
                }
            }
        }
    }

    fn require_reboot(&self, error_type: ErrorType, reason: String) -> KernelError {
        tracing::error!(%error_type, %reason, "decision loop must restart from failsafe-verified state");
        *self.reboot_flag() = Some((error_type, reason.clone()));
        KernelError::RecoveryFatal { error_type, reason }
    }

    /// Serve the last known-good decision, flagged degraded.
    fn fallback_or_fail(&self, tick: u64, error: DecisionError) -> Result<TickOutcome> {
        let Some(known_good) = self.known_good().clone() else {
            return Err(KernelError::Decision(error));
        };
        tracing::warn!(
            decision = %known_good.last_decision,
            %error,
            "serving last known-good decision"
        );
        Ok(TickOutcome {
            tick,
            confidence: self.degradation.cap_confidence(known_good.confidence_score),
            decision: known_good.last_decision,
            justification: known_good.justification,
            source: DecisionSource::Fallback,
            degraded: true,
        })
    }

    async fn complete(
        &self,
        tick: u64,
        decision: Decision,
        source: DecisionSource,
        context: &DecisionContext,
    ) -> Result<TickOutcome> {
        let degraded = self.degradation.is_degraded();
        let confidence = self.degradation.cap_confidence(decision.confidence);

        let state = DecisionState::new(&decision.decision, confidence, &decision.justification);
        let persisted = self.persist(&state, context).await?;
        *self.known_good() = Some(state);

        if !degraded {
            self.check_contradiction(&decision, context);
        }
        let cadences = self.run_cadences(tick, &decision.decision, degraded).await?;
        self.degradation.observe(persisted.max(cadences));

        Ok(TickOutcome {
            tick,
            decision: decision.decision,
            confidence,
            justification: decision.justification,
            source,
            degraded,
        })
    }

    /// Write the tick into the state document. Fatal failures are observed
    /// here; any other outcome is left to the caller.
    async fn persist(&self, state: &DecisionState, context: &DecisionContext) -> Result<Outcome> {
        let inputs = match toml::Value::try_from(context.as_map()) {
            Ok(toml::Value::Table(table)) if !table.is_empty() => Some(table),
            Ok(_) => None,
            Err(error) => {
                tracing::debug!(%error, "context not representable in TOML; inputs skipped");
                None
            }
        };
        let performance = context
            .get_f64("status.cpu")
            .zip(context.get_f64("status.ram"))
            .map(|(cpu_usage, memory_usage)| PerformanceSection {
                cpu_usage,
                memory_usage,
            });
        let metrics = self.breaker.metrics();
        let healthy = !self.degradation.is_degraded();

        let write = || {
            self.state.update(|doc| {
                doc.decision = Some(state.clone());
                if inputs.is_some() {
                    doc.inputs.clone_from(&inputs);
                }
                if performance.is_some() {
                    doc.performance.clone_from(&performance);
                }
                doc.health = Some(HealthSection {
                    is_healthy: healthy,
                    error_count: metrics.total_failures + metrics.unexpected_errors,
                });
                doc.circuit_breaker = Some(CircuitSection {
                    state: metrics.state.to_string(),
                });
            })
        };

        let Err(error) = write() else {
            return Ok(Outcome::Recovered);
        };
        let plan = self
            .recovery
            .plan(ErrorType::from(&error), self.known_good().is_some());
        let mut last_error = error;
        if plan.strategy == Strategy::Retry {
            for attempt in 1..=plan.max_retries {
                tokio::time::sleep(self.recovery.backoff(attempt)).await;
                match write() {
                    Ok(()) => {
                        self.recovery.record(
                            &plan,
                            Outcome::Recovered,
                            attempt,
                            last_error.to_string(),
                        );
                        return Ok(Outcome::Recovered);
                    }
                    Err(next) => last_error = next,
                }
            }
        }

        if plan.strategy == Strategy::RebootRequired {
            self.recovery
                .record(&plan, Outcome::Fatal, 0, last_error.to_string());
            self.degradation.observe(Outcome::Fatal);
            return Err(self.require_reboot(plan.error_type, last_error.to_string()));
        }
        self.recovery.record(
            &plan,
            Outcome::Escalated,
            plan.max_retries,
            last_error.to_string(),
        );
        tracing::error!(error = %last_error, "decision state not persisted");
        Ok(Outcome::Escalated)
    }

    fn check_contradiction(&self, decision: &Decision, context: &DecisionContext) {
        let Some(peer) = context.get_str(&self.schedule.peer_decision_key) else {
            return;
        };
        if peer == decision.decision {
            return;
        }
        tracing::info!(ours = %decision.decision, peer, "contradiction with peer decision");
        self.events.append(
            EventType::Contradiction,
            "kernel",
            serde_json::json!({
                "decision": decision.decision,
                "peer_decision": peer,
                "peer_key": self.schedule.peer_decision_key,
            }),
        );
    }

    async fn run_cadences(&self, tick: u64, decision: &str, degraded: bool) -> Result<Outcome> {
        let significant = self
            .schedule
            .significant_decisions
            .iter()
            .any(|d| d == decision);
        let on_cadence =
            self.schedule.snapshot_every > 0 && tick.is_multiple_of(self.schedule.snapshot_every);
        let outcome = if significant || (on_cadence && !degraded) {
            self.take_snapshot().await?
        } else {
            Outcome::Recovered
        };

        if self.schedule.backup_every > 0 && tick.is_multiple_of(self.schedule.backup_every) {
            match self.failsafe.create_backup() {
                Ok(Some(path)) => tracing::debug!(backup = %path.display(), "backup created"),
                Ok(None) => {}
                Err(error) => tracing::warn!(%error, "state backup failed"),
            }
        }
        Ok(outcome)
    }

    /// Snapshot with bounded retries; on persistent failure the failsafe
    /// hook runs, and a hook timeout is fatal.
    async fn take_snapshot(&self) -> Result<Outcome> {
        let Err(error) = self.snapshots.generate_detailed(None, None) else {
            return Ok(Outcome::Recovered);
        };
        let plan = self
            .recovery
            .plan(ErrorType::from(&error), self.known_good().is_some());
        let mut last_error = error;
        if plan.strategy == Strategy::Retry {
            for attempt in 1..=plan.max_retries {
                tokio::time::sleep(self.recovery.backoff(attempt)).await;
                match self.snapshots.generate_detailed(None, None) {
                    Ok(_) => {
                        self.recovery.record(
                            &plan,
                            Outcome::Recovered,
                            attempt,
                            last_error.to_string(),
                        );
                        return Ok(Outcome::Recovered);
                    }
                    Err(next) => last_error = next,
                }
            }
        }
        self.recovery.record(
            &plan,
            Outcome::Escalated,
            plan.max_retries,
            last_error.to_string(),
        );

        if !self.schedule.snapshot_fallback {
            return Ok(Outcome::Escalated);
        }
        match self.snapshots.run_failsafe().await {
            Ok(established) => {
                tracing::info!(established, "failsafe ran after snapshot failure");
                Ok(Outcome::Escalated)
            }
            Err(error) => {
                let plan = self
                    .recovery
                    .plan(ErrorType::from(&error), self.known_good().is_some());
                if plan.strategy == Strategy::RebootRequired {
                    self.recovery
                        .record(&plan, Outcome::Fatal, 0, error.to_string());
                    self.degradation.observe(Outcome::Fatal);
                    return Err(self.require_reboot(plan.error_type, error.to_string()));
                }
                self.recovery
                    .record(&plan, Outcome::Escalated, 0, error.to_string());
                Ok(Outcome::Escalated)
            }
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        let circuit = self.breaker.metrics();
        let degradation = self.degradation.status();
        let reboot_required = self.reboot_flag().is_some();
        let degraded_mode = degradation.mode == crate::recovery::Mode::Degraded;

        let level = if reboot_required || circuit.state == CircuitState::Open {
            HealthLevel::Critical
        } else if degraded_mode
            || circuit.state == CircuitState::HalfOpen
            || circuit.consecutive_failures > 0
        {
            HealthLevel::Degraded
        } else {
            HealthLevel::Healthy
        };

        HealthStatus {
            state: circuit.state,
            consecutive_failures: circuit.consecutive_failures,
            degraded_mode,
            last_snapshot_time: self.snapshots.last_snapshot_time(),
            level,
            reboot_required,
            ticks: self.ticks.load(Ordering::SeqCst),
            circuit,
            recovery: self.recovery.metrics(),
            degradation,
        }
    }

    /// Restore the previous backup over the live state.
    pub fn rollback(&self) -> bool {
        match self.failsafe.rollback() {
            Ok(Some(from)) => {
                match self.state.load() {
                    Ok(state) => *self.known_good() = Some(state),
                    Err(error) => tracing::warn!(%error, "rolled-back state failed to load"),
                }
                self.events.append(
                    EventType::Maintenance,
                    "kernel",
                    serde_json::json!({"action": "rollback", "from": from.display().to_string()}),
                );
                true
            }
            Ok(None) => false,
            Err(error) => {
                tracing::error!(%error, "rollback failed");
                false
            }
        }
    }
}
