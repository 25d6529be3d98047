use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use loopguard::circuit::{CallError, CircuitBreaker, CircuitState};
use loopguard::config::CircuitConfig;
use loopguard::decision::DecisionContext;
use loopguard::error::DecisionError;
use loopguard::events::{DEFAULT_MAX_BYTES, EventStore, EventType};

use crate::kernel_harness::{ScriptedDecider, fail, ok};

fn transitions(events: &EventStore) -> Vec<(String, String)> {
    events
        .query(Some(EventType::CircuitTransition), None)
        .iter()
        .map(|e| {
            (
                e.payload_str("from").unwrap_or_default().to_string(),
                e.payload_str("to").unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[tokio::test]
async fn opens_at_threshold_then_recovers_through_single_probe() {
    let events = Arc::new(EventStore::in_memory(1_000, DEFAULT_MAX_BYTES));
    let breaker = CircuitBreaker::with_settings(
        3,
        Duration::from_millis(50),
        Duration::from_secs(1),
        Arc::clone(&events),
    );
    let decider = ScriptedDecider::new(vec![
        fail("one"),
        fail("two"),
        fail("three"),
        ok("normal", 0.4),
    ]);
    let ctx = DecisionContext::new();

    for _ in 0..3 {
        assert!(matches!(
            breaker.call(decider.as_ref(), &ctx).await,
            Err(CallError::Failed(_))
        ));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    let blocked = breaker.call(decider.as_ref(), &ctx).await;
    assert!(matches!(blocked, Err(CallError::Open { .. })));
    assert_eq!(decider.calls(), 3, "blocked call must not reach the decider");

    tokio::time::sleep(Duration::from_millis(80)).await;
    let probe = breaker.call(decider.as_ref(), &ctx).await.unwrap();
    assert_eq!(probe.decision, "normal");
    assert_eq!(breaker.state(), CircuitState::Closed);

    assert_eq!(
        transitions(&events),
        vec![
            ("CLOSED".to_string(), "OPEN".to_string()),
            ("OPEN".to_string(), "HALF_OPEN".to_string()),
            ("HALF_OPEN".to_string(), "CLOSED".to_string()),
        ]
    );
    assert_eq!(events.query(Some(EventType::CallBlocked), None).len(), 1);
    assert_eq!(events.query(Some(EventType::Error), None).len(), 3);
}

#[tokio::test]
async fn failed_probe_reopens_the_circuit() {
    let events = Arc::new(EventStore::in_memory(1_000, DEFAULT_MAX_BYTES));
    let breaker = CircuitBreaker::with_settings(
        1,
        Duration::from_millis(30),
        Duration::from_secs(1),
        Arc::clone(&events),
    );
    let decider = ScriptedDecider::new(vec![fail("down")]);
    let ctx = DecisionContext::new();

    breaker.call(decider.as_ref(), &ctx).await.unwrap_err();
    tokio::time::sleep(Duration::from_millis(50)).await;
    breaker.call(decider.as_ref(), &ctx).await.unwrap_err();

    assert_eq!(breaker.state(), CircuitState::Open);
    let last = events.latest(EventType::CircuitTransition).unwrap();
    assert_eq!(last.payload_str("reason"), Some("probe_failed"));
}

#[tokio::test]
async fn slow_decisions_time_out_as_domain_failures() {
    let events = Arc::new(EventStore::in_memory(1_000, DEFAULT_MAX_BYTES));
    let breaker = CircuitBreaker::with_settings(
        1,
        Duration::from_secs(60),
        Duration::from_millis(20),
        Arc::clone(&events),
    );
    let decider = ScriptedDecider::slow(vec![ok("normal", 0.4)], Duration::from_millis(500));

    let err = breaker
        .call(decider.as_ref(), &DecisionContext::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Failed(DecisionError::TimedOut(_))));
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.metrics().total_failures, 1);
}

#[tokio::test]
async fn unexpected_errors_do_not_trip_the_threshold() {
    let events = Arc::new(EventStore::in_memory(1_000, DEFAULT_MAX_BYTES));
    let breaker = CircuitBreaker::with_settings(
        2,
        Duration::from_secs(60),
        Duration::from_secs(1),
        Arc::clone(&events),
    );
    let decider = ScriptedDecider::new(vec![Err(DecisionError::Unexpected("bug".into()))]);
    let ctx = DecisionContext::new();

    for _ in 0..4 {
        breaker.call(decider.as_ref(), &ctx).await.unwrap_err();
    }
    let metrics = breaker.metrics();
    assert_eq!(metrics.state, CircuitState::Closed);
    assert_eq!(metrics.unexpected_errors, 4);
    assert_eq!(events.query(Some(EventType::SystemError), None).len(), 4);
}

#[tokio::test]
async fn open_circuit_survives_restart_through_event_log() {
    let tmp = TempDir::new().unwrap();
    let log = tmp.path().join("events.jsonl");
    let config = CircuitConfig {
        failure_threshold: 2,
        cooldown_secs: 60,
        restore_from_events: true,
        ..CircuitConfig::default()
    };
    let ctx = DecisionContext::new();

    {
        let events = Arc::new(EventStore::open(&log, 1_000, DEFAULT_MAX_BYTES).unwrap());
        let breaker = CircuitBreaker::new(&config, events);
        let decider = ScriptedDecider::new(vec![fail("down")]);
        breaker.call(decider.as_ref(), &ctx).await.unwrap_err();
        breaker.call(decider.as_ref(), &ctx).await.unwrap_err();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    let events = Arc::new(EventStore::open(&log, 1_000, DEFAULT_MAX_BYTES).unwrap());
    let breaker = CircuitBreaker::new(&config, events);
    assert_eq!(breaker.state(), CircuitState::Open);
    assert!(breaker.metrics().consecutive_failures >= 2);

    let decider = ScriptedDecider::new(vec![ok("normal", 0.4)]);
    assert!(matches!(
        breaker.call(decider.as_ref(), &ctx).await,
        Err(CallError::Open { .. })
    ));
    assert_eq!(decider.calls(), 0);
}
