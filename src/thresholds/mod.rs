//! Decision thresholds and the feedback loop that tunes them.

use crate::events::{EventStore, EventType};
use crate::utils::fs::write_atomic;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Minimum `"monitor"` decisions among the last [`LOWER_THRESHOLD_WINDOW`]
/// for the alert threshold to be lowered.
pub const LOWER_THRESHOLD_MIN_MONITOR: usize = 8;
pub const LOWER_THRESHOLD_WINDOW: usize = 10;

const INCREASE_FACTOR: f64 = 1.1;
const DECREASE_FACTOR: f64 = 0.9;

fn default_cpu_alert() -> f64 {
    80.0
}

fn default_cpu_watch() -> f64 {
    60.0
}

fn default_cpu_lowered_alert() -> f64 {
    70.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Above this CPU percentage the decider asks to reduce load.
    #[serde(default = "default_cpu_alert")]
    pub cpu_alert: f64,
    #[serde(default = "default_cpu_watch")]
    pub cpu_watch: f64,
    /// Alert level used while the monitor streak says the loop is too lax.
    #[serde(default = "default_cpu_lowered_alert")]
    pub cpu_lowered_alert: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_alert: default_cpu_alert(),
            cpu_watch: default_cpu_watch(),
            cpu_lowered_alert: default_cpu_lowered_alert(),
        }
    }
}

impl Thresholds {
    /// Missing file means defaults.
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => toml::from_str(&raw)
                .with_context(|| format!("Failed to parse thresholds {}", path.display())),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => {
                Err(error).with_context(|| format!("Failed to read thresholds {}", path.display()))
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let rendered = toml::to_string_pretty(self).context("Failed to serialize thresholds")?;
        write_atomic(path, rendered.as_bytes())
            .with_context(|| format!("Failed to write thresholds {}", path.display()))
    }
}

/// Lock-free, hot-reloadable view of the thresholds file.
#[derive(Clone)]
pub struct ThresholdHandle {
    inner: Arc<ArcSwap<Thresholds>>,
    path: PathBuf,
}

impl ThresholdHandle {
    pub fn new(thresholds: Thresholds, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(thresholds)),
            path: path.into(),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let thresholds = Thresholds::load(&path)?;
        Ok(Self::new(thresholds, path))
    }

    pub fn load(&self) -> arc_swap::Guard<Arc<Thresholds>> {
        self.inner.load()
    }

    pub fn load_full(&self) -> Arc<Thresholds> {
        self.inner.load_full()
    }

    /// Re-read the file and swap it in only when it changed.
    pub fn reload(&self) -> Result<bool> {
        let fresh = Thresholds::load(&self.path)?;
        if *self.inner.load_full() == fresh {
            return Ok(false);
        }
        self.inner.store(Arc::new(fresh));
        tracing::info!(path = %self.path.display(), "thresholds hot-reloaded");
        Ok(true)
    }

    pub fn store(&self, thresholds: Thresholds) {
        self.inner.store(Arc::new(thresholds));
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `increase` scales by 1.1, `decrease` by 0.9, anything else is a no-op.
pub fn adjust_threshold(current: f64, feedback: &str) -> f64 {
    match feedback {
        "increase" => current * INCREASE_FACTOR,
        "decrease" => current * DECREASE_FACTOR,
        _ => current,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdjustmentReport {
    pub trigger: String,
    pub monitor_count: usize,
    pub window: usize,
    pub current: Thresholds,
    pub proposed: Thresholds,
    pub changed: bool,
    pub applied: bool,
}

/// Reads decision history from the event store and proposes threshold moves.
#[derive(Clone)]
pub struct AdaptiveThresholdAdjuster {
    events: Arc<EventStore>,
}

impl AdaptiveThresholdAdjuster {
    pub fn new(events: Arc<EventStore>) -> Self {
        Self { events }
    }

    /// Occurrences of `action` among the last `window` decisions.
    pub fn count_recent_action(&self, action: &str, window: usize) -> usize {
        self.events
            .recent_decisions(window)
            .iter()
            .filter(|event| event.payload_str("decision") == Some(action))
            .count()
    }

    pub fn should_lower_threshold(&self) -> bool {
        self.count_recent_action("monitor", LOWER_THRESHOLD_WINDOW) >= LOWER_THRESHOLD_MIN_MONITOR
    }

    /// Propose lowering `cpu_alert` when the monitor streak holds. Nothing is
    /// written unless `apply` is set.
    pub fn run_cycle(&self, handle: &ThresholdHandle, apply: bool) -> Result<AdjustmentReport> {
        let feedback = if self.should_lower_threshold() {
            "decrease"
        } else {
            "hold"
        };
        self.adjust(handle, feedback, "monitor_streak", apply)
    }

    /// Apply operator feedback (`increase` / `decrease`) to `cpu_alert`.
    pub fn apply_feedback(
        &self,
        handle: &ThresholdHandle,
        feedback: &str,
        apply: bool,
    ) -> Result<AdjustmentReport> {
        self.adjust(handle, feedback, "operator_feedback", apply)
    }

    fn adjust(
        &self,
        handle: &ThresholdHandle,
        feedback: &str,
        trigger: &str,
        apply: bool,
    ) -> Result<AdjustmentReport> {
        let current = handle.load_full().as_ref().clone();
        let mut proposed = current.clone();
        proposed.cpu_alert = adjust_threshold(current.cpu_alert, feedback)
            .max(current.cpu_watch)
            .min(100.0);
        let changed = (proposed.cpu_alert - current.cpu_alert).abs() > f64::EPSILON;

        let applied = apply && changed;
        if applied {
            proposed.save(handle.path())?;
            handle.store(proposed.clone());
            self.events.append(
                EventType::ThresholdAdjusted,
                "thresholds",
                serde_json::json!({
                    "trigger": trigger,
                    "feedback": feedback,
                    "from": current.cpu_alert,
                    "to": proposed.cpu_alert,
                }),
            );
            tracing::info!(
                trigger,
                from = current.cpu_alert,
                to = proposed.cpu_alert,
                "cpu_alert threshold adjusted"
            );
        }

        Ok(AdjustmentReport {
            trigger: trigger.to_string(),
            monitor_count: self.count_recent_action("monitor", LOWER_THRESHOLD_WINDOW),
            window: LOWER_THRESHOLD_WINDOW,
            current,
            proposed,
            changed,
            applied,
        })
    }
}
