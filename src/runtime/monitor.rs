use super::health::HealthRegistry;
use crate::circuit::CircuitState;
use crate::config::Config;
use crate::events::Anomaly;
use crate::kernel::{HealthLevel, HealthStatus, Kernel};
use crate::thresholds::ThresholdHandle;
use crate::utils::fs::write_atomic;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const CLEANUP_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

/// Contents of the status file written on every monitor pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub written_at: DateTime<Utc>,
    /// False once the loop has stopped; the rest is its final view.
    pub running: bool,
    pub interval_secs: u64,
    pub kernel: HealthStatus,
    pub anomalies: Vec<Anomaly>,
    pub components: serde_json::Value,
}

impl StatusReport {
    /// `Ok(None)` when no loop has written a status file yet.
    pub fn read(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("Failed to read status file {}", path.display()));
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .with_context(|| format!("Failed to parse status file {}", path.display()))
    }

    pub fn age(&self) -> TimeDelta {
        Utc::now() - self.written_at
    }

    /// A running loop that missed three monitor passes.
    pub fn is_stale(&self) -> bool {
        let interval = i64::try_from(self.interval_secs.max(1)).unwrap_or(i64::MAX);
        self.running && self.age() > TimeDelta::seconds(interval.saturating_mul(3))
    }
}

/// Background watchdog: refreshes component health, scans for anomalies,
/// hot-reloads thresholds and writes the status file.
pub struct Monitor {
    kernel: Arc<Kernel>,
    health: Arc<HealthRegistry>,
    thresholds: ThresholdHandle,
    interval: Duration,
    anomaly_window_minutes: u64,
    retention_days: u32,
    status_file: PathBuf,
    last_cleanup: Option<Instant>,
}

impl Monitor {
    pub fn new(
        config: &Config,
        kernel: Arc<Kernel>,
        health: Arc<HealthRegistry>,
        thresholds: ThresholdHandle,
    ) -> Self {
        Self {
            kernel,
            health,
            thresholds,
            interval: Duration::from_secs(config.monitor.interval_secs.max(1)),
            anomaly_window_minutes: config.monitor.anomaly_window_minutes,
            retention_days: config.events.retention_days,
            status_file: config.status_file(),
            last_cleanup: None,
        }
    }

    /// One monitor pass. Returns the anomalies seen in the window.
    pub fn run_once(&mut self) -> Vec<Anomaly> {
        self.pass(true)
    }

    /// Last pass after the loop stopped, so the status file keeps its final view.
    pub fn finish(&mut self) {
        self.pass(false);
    }

    fn pass(&mut self, running: bool) -> Vec<Anomaly> {
        let status = self.kernel.health_status();
        match status.level {
            HealthLevel::Critical => self.health.mark_error("kernel", status.level),
            HealthLevel::Healthy | HealthLevel::Degraded => self.health.mark_ok("kernel"),
        }
        if status.state == CircuitState::Closed {
            self.health.mark_ok("circuit");
        } else {
            self.health.mark_error("circuit", status.state);
        }

        let anomalies = self.kernel.events().detect_anomalies(self.anomaly_window_minutes);
        for anomaly in &anomalies {
            tracing::warn!(
                kind = %anomaly.kind,
                severity = %anomaly.severity,
                count = anomaly.count,
                window_minutes = anomaly.window_minutes,
                "event anomaly detected"
            );
        }
        if anomalies.is_empty() {
            self.health.mark_ok("events");
        } else {
            self.health
                .mark_error("events", format!("{} anomalies", anomalies.len()));
        }

        match self.thresholds.reload() {
            Ok(_) => self.health.mark_ok("thresholds"),
            Err(error) => {
                tracing::warn!(%error, "threshold reload failed; keeping current values");
                self.health.mark_error("thresholds", error);
            }
        }

        if self
            .last_cleanup
            .is_none_or(|at| at.elapsed() >= CLEANUP_EVERY)
        {
            self.kernel.events().cleanup(self.retention_days);
            self.last_cleanup = Some(Instant::now());
        }

        let report = StatusReport {
            written_at: Utc::now(),
            running,
            interval_secs: self.interval.as_secs(),
            kernel: status,
            anomalies,
            components: self.health.snapshot_json(),
        };
        self.write_status(&report);
        report.anomalies
    }

    fn write_status(&self, report: &StatusReport) {
        let data = match serde_json::to_vec_pretty(report) {
            Ok(data) => data,
            Err(error) => {
                tracing::warn!(%error, "failed to serialize status report");
                return;
            }
        };
        if let Err(error) = write_atomic(&self.status_file, &data) {
            tracing::warn!(path = %self.status_file.display(), %error, "failed to write status file");
        }
    }

    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        self.finish();
                        break;
                    }
                    _ = interval.tick() => {
                        self.run_once();
                    }
                }
            }
            tracing::debug!("monitor stopped");
        })
    }
}
