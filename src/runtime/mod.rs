//! Periodic decision loop around the [`Kernel`].

pub mod health;
pub mod monitor;

pub use health::{ComponentHealth, HealthRegistry, HealthSnapshot};
pub use monitor::{Monitor, StatusReport};

use crate::config::Config;
use crate::decision::{DecisionContext, FileContextSource, RuleBasedDecider};
use crate::error::KernelError;
use crate::events::EventStore;
use crate::failsafe::FailsafeOutcome;
use crate::kernel::{DecisionSource, HealthStatus, Kernel};
use crate::thresholds::{AdaptiveThresholdAdjuster, ThresholdHandle};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// Kernel wired to the rule-based decider, plus the threshold handle the
/// decider reads from.
pub struct Assembly {
    pub kernel: Arc<Kernel>,
    pub thresholds: ThresholdHandle,
}

pub fn assemble(config: &Config) -> Result<Assembly> {
    let events = Arc::new(EventStore::from_config(config).with_context(|| {
        format!("Failed to open event log {}", config.events_file().display())
    })?);
    let thresholds = ThresholdHandle::open(config.thresholds_file())?;
    let decider = RuleBasedDecider::new(thresholds.clone())
        .with_adjuster(AdaptiveThresholdAdjuster::new(Arc::clone(&events)));
    let kernel = Kernel::new(config, Arc::new(decider), events);
    Ok(Assembly {
        kernel: Arc::new(kernel),
        thresholds,
    })
}

/// Health as seen from outside the loop.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ObservedStatus {
    /// Written by the monitor of a running (or last stopped) loop.
    Recorded(StatusReport),
    /// No status file yet; circuit state rebuilt from events, nothing else.
    InProcess { kernel: HealthStatus },
}

impl ObservedStatus {
    pub fn health(&self) -> &HealthStatus {
        match self {
            Self::Recorded(report) => &report.kernel,
            Self::InProcess { kernel } => kernel,
        }
    }
}

/// Prefer the monitor's status file; fall back to `kernel`'s own view.
pub fn observe_status(config: &Config, kernel: &Kernel) -> Result<ObservedStatus> {
    Ok(match StatusReport::read(&config.status_file())? {
        Some(report) => ObservedStatus::Recorded(report),
        None => ObservedStatus::InProcess {
            kernel: kernel.health_status(),
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    TickLimit,
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    pub ticks: u64,
    pub decisions: u64,
    pub fallbacks: u64,
    pub blocked: u64,
    pub failed: u64,
}

/// Tick `kernel` every `period` until `max_ticks` or cancellation.
///
/// Only [`KernelError::RecoveryFatal`] ends the loop with an error; an
/// in-flight tick always completes before cancellation is honoured.
pub async fn run_loop(
    kernel: &Kernel,
    context: &FileContextSource,
    period: Duration,
    max_ticks: Option<u64>,
    health: &HealthRegistry,
    cancel: &CancellationToken,
) -> std::result::Result<(LoopReport, StopReason), KernelError> {
    let mut report = LoopReport::default();
    loop {
        if cancel.is_cancelled() {
            return Ok((report, StopReason::Cancelled));
        }
        if max_ticks.is_some_and(|max| report.ticks >= max) {
            return Ok((report, StopReason::TickLimit));
        }
        report.ticks += 1;

        let ctx = match context.load() {
            Ok(ctx) => {
                health.mark_ok("context");
                ctx
            }
            Err(error) => {
                tracing::warn!(error = %format!("{error:#}"), "context unavailable; deciding on empty input");
                health.mark_error("context", format!("{error:#}"));
                DecisionContext::new()
            }
        };

        match kernel.tick(&ctx).await {
            Ok(outcome) => {
                health.mark_ok("loop");
                if outcome.source == DecisionSource::Fallback {
                    report.fallbacks += 1;
                } else {
                    report.decisions += 1;
                }
                tracing::info!(
                    tick = outcome.tick,
                    decision = %outcome.decision,
                    confidence = outcome.confidence,
                    source = %outcome.source,
                    degraded = outcome.degraded,
                    "tick complete"
                );
            }
            Err(KernelError::CircuitOpen { retry_in }) => {
                report.blocked += 1;
                health.mark_error("loop", "circuit open");
                tracing::warn!(?retry_in, "decision skipped; circuit open");
            }
            Err(error @ KernelError::RecoveryFatal { .. }) => {
                health.mark_error("loop", &error);
                return Err(error);
            }
            Err(error) => {
                report.failed += 1;
                health.mark_error("loop", &error);
                tracing::warn!(%error, "tick failed");
            }
        }

        if max_ticks.is_some_and(|max| report.ticks >= max) {
            continue;
        }
        tokio::select! {
            () = cancel.cancelled() => {}
            () = tokio::time::sleep(period) => {}
        }
    }
}

/// `loopguard run`: failsafe check, monitor, loop, Ctrl-C handling.
pub async fn run(config: &Config, max_ticks: Option<u64>) -> Result<LoopReport> {
    let assembly = assemble(config)?;
    let kernel = assembly.kernel;

    match kernel.bootstrap()? {
        FailsafeOutcome::Restored { from } => {
            tracing::warn!(backup = %from.display(), "state restored from backup before start");
        }
        outcome if !outcome.allows_start() => bail!("state file unusable; refusing to start"),
        _ => {}
    }

    let health = Arc::new(HealthRegistry::new());
    health.mark_ok("kernel");
    let cancel = CancellationToken::new();

    let monitor = config.monitor.enabled.then(|| {
        Monitor::new(
            config,
            Arc::clone(&kernel),
            Arc::clone(&health),
            assembly.thresholds.clone(),
        )
        .spawn(cancel.clone())
    });

    let signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("stop requested; finishing current tick");
                cancel.cancel();
            }
        })
    };

    let context = FileContextSource::new(config.context_file());
    let period = Duration::from_secs(config.decision_loop.tick_secs.max(1));
    tracing::info!(
        state = %config.state_file().display(),
        context = %context.path().display(),
        tick_secs = period.as_secs(),
        "decision loop started"
    );
    let result = run_loop(&kernel, &context, period, max_ticks, &health, &cancel).await;

    cancel.cancel();
    signal.abort();
    if let Some(handle) = monitor {
        let _ = handle.await;
    }

    let (report, reason) = result?;
    tracing::info!(
        %reason,
        ticks = report.ticks,
        decisions = report.decisions,
        fallbacks = report.fallbacks,
        blocked = report.blocked,
        failed = report.failed,
        "decision loop stopped"
    );
    Ok(report)
}
