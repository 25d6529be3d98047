use super::Outcome;
use crate::config::DegradationConfig;
use crate::events::{EventStore, EventType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Normal,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationStatus {
    pub mode: Mode,
    pub window_len: usize,
    pub failures_in_window: usize,
    pub consecutive_recovered: u32,
    pub since: Option<DateTime<Utc>>,
}

struct Window {
    outcomes: VecDeque<Outcome>,
    mode: Mode,
    consecutive_recovered: u32,
    since: Option<DateTime<Utc>>,
}

impl Window {
    fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, Outcome::Escalated | Outcome::Fatal))
            .count()
    }
}

/// Sliding-window switch between normal and reduced-functionality operation.
pub struct DegradationController {
    window: usize,
    escalation_ratio: f64,
    recover_after: u32,
    confidence_cap: f64,
    state: Mutex<Window>,
    events: Arc<EventStore>,
}

impl DegradationController {
    pub fn new(config: &DegradationConfig, events: Arc<EventStore>) -> Self {
        Self {
            window: config.window.max(1),
            escalation_ratio: config.escalation_ratio,
            recover_after: config.recover_after.max(1),
            confidence_cap: config.confidence_cap,
            state: Mutex::new(Window {
                outcomes: VecDeque::with_capacity(config.window),
                mode: Mode::Normal,
                consecutive_recovered: 0,
                since: None,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Feed one outcome; returns the new mode when it changed.
    pub fn observe(&self, outcome: Outcome) -> Option<Mode> {
        let mut state = self.lock();
        state.outcomes.push_back(outcome);
        while state.outcomes.len() > self.window {
            state.outcomes.pop_front();
        }
        state.consecutive_recovered = match outcome {
            Outcome::Recovered => state.consecutive_recovered.saturating_add(1),
            Outcome::Escalated | Outcome::Fatal => 0,
        };

        let failures = state.failures();
        #[allow(clippy::cast_precision_loss)]
        let ratio = failures as f64 / self.window as f64;

        let next = match state.mode {
            Mode::Normal if ratio > self.escalation_ratio => Mode::Degraded,
            Mode::Degraded if state.consecutive_recovered >= self.recover_after => Mode::Normal,
            current => current,
        };
        if next == state.mode {
            return None;
        }

        let previous = state.mode;
        state.mode = next;
        state.since = Some(Utc::now());
        if next == Mode::Normal {
            state.outcomes.clear();
        }
        let consecutive_recovered = state.consecutive_recovered;
        drop(state);

        let reason = match next {
            Mode::Degraded => "failure_ratio_exceeded",
            Mode::Normal => "consecutive_recoveries",
        };
        tracing::debug!(failures, consecutive_recovered, "degradation window evaluated");
        self.announce(previous, next, failures, reason);
        Some(next)
    }

    /// Enter degraded mode directly, e.g. when a failure has no known-good
    /// state to fall back on. Returns whether the mode changed.
    pub fn enter_degraded(&self, reason: &str) -> bool {
        let mut state = self.lock();
        if state.mode == Mode::Degraded {
            return false;
        }
        state.mode = Mode::Degraded;
        state.since = Some(Utc::now());
        state.consecutive_recovered = 0;
        let failures = state.failures();
        drop(state);

        self.announce(Mode::Normal, Mode::Degraded, failures, reason);
        true
    }

    fn announce(&self, from: Mode, to: Mode, failures: usize, reason: &str) {
        match to {
            Mode::Degraded => tracing::warn!(failures, reason, "entering degraded mode"),
            Mode::Normal => tracing::info!(reason, "leaving degraded mode"),
        }
        self.events.append(
            EventType::ModeChange,
            "degradation",
            serde_json::json!({
                "from": from.to_string(),
                "to": to.to_string(),
                "reason": reason,
                "failures_in_window": failures,
                "window": self.window,
            }),
        );
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn is_degraded(&self) -> bool {
        self.mode() == Mode::Degraded
    }

    /// Clamp `confidence` while degraded.
    pub fn cap_confidence(&self, confidence: f64) -> f64 {
        confidence.min(self.confidence_ceiling())
    }

    /// Highest confidence that may be served in the current mode.
    pub fn confidence_ceiling(&self) -> f64 {
        if self.is_degraded() {
            self.confidence_cap
        } else {
            1.0
        }
    }

    pub fn status(&self) -> DegradationStatus {
        let state = self.lock();
        DegradationStatus {
            mode: state.mode,
            window_len: state.outcomes.len(),
            failures_in_window: state.failures(),
            consecutive_recovered: state.consecutive_recovered,
            since: state.since,
        }
    }
}
