//! Circuit breaker around the decision function.
//!
//! CLOSED passes calls through. After `failure_threshold` consecutive domain
//! failures the breaker goes OPEN and short-circuits every call until the
//! cooldown has elapsed since the last failure; then exactly one probe runs in
//! HALF_OPEN and decides between CLOSED and OPEN again.

use crate::config::CircuitConfig;
use crate::decision::{Decision, DecisionContext, DecisionFunction};
use crate::error::DecisionError;
use crate::events::{EventStore, EventType};
use crate::recovery::ErrorType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub total_failures: u64,
    pub unexpected_errors: u64,
    pub blocked_calls: u64,
    pub state_changes: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

impl Default for CircuitMetrics {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            total_calls: 0,
            successful_calls: 0,
            total_failures: 0,
            unexpected_errors: 0,
            blocked_calls: 0,
            state_changes: 0,
            last_failure_at: None,
        }
    }
}

impl CircuitMetrics {
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        (self.total_failures + self.unexpected_errors) as f64 / self.total_calls as f64
    }

    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.successful_calls as f64 / self.total_calls as f64
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("circuit open; retry in {retry_in:?}")]
    Open { retry_in: Duration },

    #[error(transparent)]
    Failed(#[from] DecisionError),
}

struct Inner {
    metrics: CircuitMetrics,
    last_failure: Option<Instant>,
    probe_in_flight: bool,
}

pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    call_timeout: Duration,
    inner: Mutex<Inner>,
    events: Arc<EventStore>,
}

/// Clears the half-open probe slot if the call future is dropped mid-flight.
struct ProbeSlot<'a> {
    breaker: &'a CircuitBreaker,
    is_probe: bool,
}

impl Drop for ProbeSlot<'_> {
    fn drop(&mut self) {
        if self.is_probe {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: &CircuitConfig, events: Arc<EventStore>) -> Self {
        let breaker = Self::with_settings(
            config.failure_threshold,
            config.cooldown(),
            config.call_timeout(),
            events,
        );
        if config.restore_from_events {
            breaker.restore_from_history();
        }
        breaker
    }

    pub fn with_settings(
        failure_threshold: u32,
        cooldown: Duration,
        call_timeout: Duration,
        events: Arc<EventStore>,
    ) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            call_timeout,
            inner: Mutex::new(Inner {
                metrics: CircuitMetrics::default(),
                last_failure: None,
                probe_in_flight: false,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> CircuitState {
        self.lock().metrics.state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        self.lock().metrics.clone()
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// Run `function` through the breaker, bounded by the call timeout.
    ///
    /// Confidence outside `[0, 1]` is reported as an integrity violation.
    pub async fn call(
        &self,
        function: &dyn DecisionFunction,
        context: &DecisionContext,
    ) -> Result<Decision, CallError> {
        self.call_capped(function, context, 1.0).await
    }

    /// Like [`call`](Self::call), but the `DECISION` event records the
    /// confidence as served under `ceiling`. The returned decision is uncapped.
    pub async fn call_capped(
        &self,
        function: &dyn DecisionFunction,
        context: &DecisionContext,
        ceiling: f64,
    ) -> Result<Decision, CallError> {
        let is_probe = self.admit(function.name())?;
        let _slot = ProbeSlot {
            breaker: self,
            is_probe,
        };

        let result = match tokio::time::timeout(self.call_timeout, function.decide(context)).await
        {
            Ok(result) => result.and_then(Decision::validated),
            Err(_) => Err(DecisionError::TimedOut(self.call_timeout)),
        };

        match result {
            Ok(decision) => {
                self.on_success(function.name(), &decision, ceiling);
                Ok(decision)
            }
            Err(error) => {
                self.on_failure(function.name(), &error);
                Err(CallError::Failed(error))
            }
        }
    }

    /// Returns whether the admitted call is the half-open probe.
    fn admit(&self, function: &str) -> Result<bool, CallError> {
        let mut inner = self.lock();
        inner.metrics.total_calls += 1;

        let retry_in = match inner.metrics.state {
            CircuitState::Closed => return Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map_or(self.cooldown, |at| at.elapsed());
                if elapsed >= self.cooldown {
                    self.transition(&mut inner, CircuitState::HalfOpen, "cooldown_elapsed");
                    inner.probe_in_flight = true;
                    return Ok(true);
                }
                self.cooldown - elapsed
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                return Ok(true);
            }
            CircuitState::HalfOpen => self.call_timeout,
        };

        inner.metrics.blocked_calls += 1;
        let state = inner.metrics.state;
        drop(inner);

        tracing::debug!(function, %state, ?retry_in, "decision call short-circuited");
        self.events.append(
            EventType::CallBlocked,
            "circuit",
            json!({
                "function": function,
                "state": state.to_string(),
                "retry_in_ms": u64::try_from(retry_in.as_millis()).unwrap_or(u64::MAX),
            }),
        );
        Err(CallError::Open { retry_in })
    }

    fn on_success(&self, function: &str, decision: &Decision, ceiling: f64) {
        let mut inner = self.lock();
        inner.metrics.successful_calls += 1;
        inner.metrics.consecutive_failures = 0;
        if inner.metrics.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            self.transition(&mut inner, CircuitState::Closed, "probe_succeeded");
        }
        let success_rate = inner.metrics.success_rate();
        drop(inner);

        self.events.append(
            EventType::Decision,
            "circuit",
            json!({
                "function": function,
                "decision": decision.decision,
                "confidence": decision.confidence.min(ceiling),
                "raw_confidence": decision.confidence,
                "justification": decision.justification,
                "success_rate": success_rate,
            }),
        );
    }

    fn on_failure(&self, function: &str, error: &DecisionError) {
        let mut inner = self.lock();
        let was_probe = inner.metrics.state == CircuitState::HalfOpen;

        if error.is_domain() {
            inner.metrics.consecutive_failures = inner.metrics.consecutive_failures.saturating_add(1);
            inner.metrics.total_failures += 1;
            tracing::warn!(
                function,
                %error,
                consecutive_failures = inner.metrics.consecutive_failures,
                "decision call failed"
            );
        } else {
            inner.metrics.unexpected_errors += 1;
            tracing::error!(function, %error, "unexpected failure in decision call");
        }
        inner.metrics.last_failure_at = Some(Utc::now());
        inner.last_failure = Some(Instant::now());

        if was_probe {
            inner.probe_in_flight = false;
            self.transition(&mut inner, CircuitState::Open, "probe_failed");
        } else if inner.metrics.state == CircuitState::Closed
            && inner.metrics.consecutive_failures >= self.failure_threshold
        {
            self.transition(&mut inner, CircuitState::Open, "failure_threshold_reached");
        }

        let state = inner.metrics.state;
        let consecutive_failures = inner.metrics.consecutive_failures;
        drop(inner);

        let (kind, payload) = if error.is_domain() {
            (
                EventType::Error,
                json!({
                    "function": function,
                    "error_type": ErrorType::from(error).to_string(),
                    "message": error.to_string(),
                    "consecutive_failures": consecutive_failures,
                    "state": state.to_string(),
                }),
            )
        } else {
            (
                EventType::SystemError,
                json!({
                    "function": function,
                    "error": error.to_string(),
                    "state": state.to_string(),
                }),
            )
        };
        self.events.append(kind, "circuit", payload);
    }

    /// Force CLOSED. Returns whether the state changed.
    pub fn reset(&self) -> bool {
        let mut inner = self.lock();
        inner.metrics.consecutive_failures = 0;
        inner.probe_in_flight = false;
        if inner.metrics.state == CircuitState::Closed {
            return false;
        }
        self.transition(&mut inner, CircuitState::Closed, "manual_reset");
        true
    }

    /// Rebuild state from the most recent `CIRCUIT_TRANSITION` event.
    pub fn restore_from_history(&self) -> Option<CircuitState> {
        let event = self.events.latest(EventType::CircuitTransition)?;
        let state = event
            .payload_str("to")
            .and_then(|raw| CircuitState::from_str(raw).ok())?;
        let recorded_failures = event
            .payload
            .get("consecutive_failures")
            .and_then(serde_json::Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0);

        let mut inner = self.lock();
        inner.metrics.state = state;
        inner.probe_in_flight = false;
        match state {
            CircuitState::Closed => inner.metrics.consecutive_failures = 0,
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.metrics.consecutive_failures = recorded_failures.max(self.failure_threshold);
                let age = (Utc::now() - event.timestamp).to_std().unwrap_or_default();
                inner.last_failure = Instant::now().checked_sub(age).or(Some(Instant::now()));
                inner.metrics.last_failure_at = Some(event.timestamp);
            }
        }
        drop(inner);

        tracing::info!(%state, event = %event.id, "circuit state restored from event log");
        Some(state)
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, reason: &str) {
        let from = inner.metrics.state;
        if from == to {
            return;
        }
        inner.metrics.state = to;
        inner.metrics.state_changes += 1;
        match to {
            CircuitState::Open => tracing::warn!(%from, %to, reason, "circuit transition"),
            CircuitState::Closed | CircuitState::HalfOpen => {
                tracing::info!(%from, %to, reason, "circuit transition");
            }
        }
        self.events.append(
            EventType::CircuitTransition,
            "circuit",
            json!({
                "from": from.to_string(),
                "to": to.to_string(),
                "reason": reason,
                "consecutive_failures": inner.metrics.consecutive_failures,
            }),
        );
    }
}
