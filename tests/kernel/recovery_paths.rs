use std::fs;

use tempfile::TempDir;

use loopguard::KernelError;
use loopguard::decision::DecisionContext;
use loopguard::error::DecisionError;
use loopguard::events::EventType;
use loopguard::failsafe::FailsafeOutcome;
use loopguard::kernel::{DecisionSource, HealthLevel};
use loopguard::recovery::{Mode, Strategy};

use crate::kernel_harness::{ScriptedDecider, build_kernel, fail, ok, test_config};

#[tokio::test]
async fn exhausted_retries_escalate_to_known_good() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.recovery.max_retries = 2;
    config.circuit.failure_threshold = 10;
    let decider = ScriptedDecider::new(vec![ok("monitor", 0.6), fail("flaky")]);
    let (kernel, events) = build_kernel(&config, decider.clone());
    let ctx = DecisionContext::new();

    kernel.tick(&ctx).await.unwrap();
    let outcome = kernel.tick(&ctx).await.unwrap();

    assert_eq!(outcome.source, DecisionSource::Fallback);
    assert_eq!(outcome.decision, "monitor");
    assert_eq!(decider.calls(), 4, "one success, one failure, two retries");

    let metrics = kernel.recovery().metrics();
    assert_eq!(metrics.escalated_count, 1);
    assert_eq!(metrics.recovered_count, 0);
    let recovery = events.latest(EventType::Recovery).unwrap();
    assert_eq!(recovery.payload_str("outcome"), Some("ESCALATED"));
    assert_eq!(
        recovery.payload_str("strategy"),
        Some(Strategy::Retry.to_string().as_str())
    );
}

#[tokio::test]
async fn degraded_mode_caps_confidence_and_defers_cadence_snapshots() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.snapshot.every_ticks = 1;
    config.snapshot.significant_decisions.clear();
    let (kernel, events) = build_kernel(&config, ScriptedDecider::new(vec![ok("normal", 0.9)]));
    let ctx = DecisionContext::new();

    assert!(kernel.degradation().enter_degraded("operator"));
    let first = kernel.tick(&ctx).await.unwrap();
    assert!(first.degraded);
    assert!((first.confidence - 0.5).abs() < f64::EPSILON);
    assert!(!config.snapshot_file().exists());
    let logged = events.latest(EventType::Decision).unwrap();
    let number = |key: &str| logged.payload.get(key).and_then(serde_json::Value::as_f64);
    assert_eq!(number("confidence"), Some(first.confidence));
    assert_eq!(number("raw_confidence"), Some(0.9));
    assert_eq!(
        kernel.state_store().load().unwrap().confidence_score,
        first.confidence
    );

    kernel.tick(&ctx).await.unwrap();
    let third = kernel.tick(&ctx).await.unwrap();
    assert!(third.degraded, "mode changes only after the third clean tick");
    assert_eq!(kernel.degradation().mode(), Mode::Normal);
    assert!(!config.snapshot_file().exists());

    let fourth = kernel.tick(&ctx).await.unwrap();
    assert!(!fourth.degraded);
    assert!((fourth.confidence - 0.9).abs() < f64::EPSILON);
    assert!(config.snapshot_file().exists());
    assert_eq!(events.query(Some(EventType::ModeChange), None).len(), 2);
}

#[tokio::test]
async fn degraded_mode_skips_contradiction_analysis() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (kernel, events) = build_kernel(&config, ScriptedDecider::new(vec![ok("normal", 0.4)]));
    let ctx = DecisionContext::from_value(serde_json::json!({
        "peer": {"last_decision": "emergency_shutdown"}
    }));

    kernel.degradation().enter_degraded("operator");
    kernel.tick(&ctx).await.unwrap();
    assert_eq!(events.count_contradictions(60), 0);
}

#[tokio::test]
async fn unwritable_state_file_does_not_stop_the_loop() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.recovery.max_retries = 1;
    fs::create_dir_all(config.state_file()).unwrap();
    let (kernel, _) = build_kernel(&config, ScriptedDecider::new(vec![ok("normal", 0.4)]));

    let outcome = kernel.tick(&DecisionContext::new()).await.unwrap();
    assert_eq!(outcome.decision, "normal");
    let metrics = kernel.recovery().metrics();
    assert_eq!(metrics.escalated_count, 1);
    assert!(config.state_file().is_dir());

    let window = kernel.degradation().status();
    assert_eq!(window.window_len, 1, "one outcome per tick");
    assert_eq!(window.failures_in_window, 1);
}

#[tokio::test]
async fn reboot_required_halts_until_restart_from_verified_state() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (kernel, _) = build_kernel(
        &config,
        ScriptedDecider::new(vec![
            ok("normal", 0.4),
            Err(DecisionError::RebootRequired("firmware".into())),
        ]),
    );
    let ctx = DecisionContext::new();
    kernel.tick(&ctx).await.unwrap();

    assert!(matches!(
        kernel.tick(&ctx).await.unwrap_err(),
        KernelError::RecoveryFatal { .. }
    ));
    assert!(matches!(
        kernel.tick(&ctx).await.unwrap_err(),
        KernelError::RecoveryFatal { .. }
    ));
    assert_eq!(kernel.health_status().level, HealthLevel::Critical);
    assert_eq!(kernel.recovery().metrics().fatal_count, 1);

    let (restarted, _) = build_kernel(&config, ScriptedDecider::new(vec![ok("monitor", 0.6)]));
    assert_eq!(restarted.bootstrap().unwrap(), FailsafeOutcome::Valid);
    assert_eq!(restarted.tick(&ctx).await.unwrap().decision, "monitor");
}
