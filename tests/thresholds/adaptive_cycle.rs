use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use loopguard::decision::{DecisionContext, DecisionFunction, RuleBasedDecider};
use loopguard::events::{DEFAULT_MAX_BYTES, EventStore, EventType};
use loopguard::thresholds::{AdaptiveThresholdAdjuster, ThresholdHandle, Thresholds};

fn log_decisions(events: &EventStore, decisions: &[&str]) {
    for decision in decisions {
        events.append(EventType::Decision, "test", json!({ "decision": decision }));
    }
}

fn monitor_streak(events: &EventStore) {
    let mut streak = vec!["normal", "normal"];
    streak.extend(["monitor"; 8]);
    log_decisions(events, &streak);
}

#[test]
fn dry_run_proposes_without_writing() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("thresholds.toml");
    let events = Arc::new(EventStore::in_memory(100, DEFAULT_MAX_BYTES));
    monitor_streak(&events);
    let handle = ThresholdHandle::open(&path).unwrap();
    let adjuster = AdaptiveThresholdAdjuster::new(Arc::clone(&events));

    let report = adjuster.run_cycle(&handle, false).unwrap();
    assert!(report.changed);
    assert!(!report.applied);
    assert_eq!(report.monitor_count, 8);
    assert!((report.proposed.cpu_alert - 72.0).abs() < 1e-9);
    assert!(!path.exists());
    assert!((handle.load().cpu_alert - 80.0).abs() < f64::EPSILON);
}

#[test]
fn applied_cycle_saves_swaps_and_records() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("thresholds.toml");
    let events = Arc::new(EventStore::in_memory(100, DEFAULT_MAX_BYTES));
    monitor_streak(&events);
    let handle = ThresholdHandle::open(&path).unwrap();

    let report = AdaptiveThresholdAdjuster::new(Arc::clone(&events))
        .run_cycle(&handle, true)
        .unwrap();
    assert!(report.applied);
    assert!((handle.load().cpu_alert - 72.0).abs() < 1e-9);
    assert_eq!(Thresholds::load(&path).unwrap(), *handle.load_full());
    assert!(events.latest(EventType::ThresholdAdjusted).is_some());
}

#[test]
fn seven_of_ten_is_not_a_streak() {
    let events = Arc::new(EventStore::in_memory(100, DEFAULT_MAX_BYTES));
    let mut decisions = vec!["normal"; 3];
    decisions.extend(["monitor"; 7]);
    log_decisions(&events, &decisions);

    let adjuster = AdaptiveThresholdAdjuster::new(events);
    assert!(!adjuster.should_lower_threshold());
    assert_eq!(adjuster.count_recent_action("monitor", 10), 7);
}

#[test]
fn operator_feedback_never_drops_below_watch_level() {
    let tmp = TempDir::new().unwrap();
    let handle = ThresholdHandle::new(
        Thresholds {
            cpu_alert: 62.0,
            ..Thresholds::default()
        },
        tmp.path().join("thresholds.toml"),
    );
    let adjuster =
        AdaptiveThresholdAdjuster::new(Arc::new(EventStore::in_memory(10, DEFAULT_MAX_BYTES)));

    let report = adjuster.apply_feedback(&handle, "decrease", true).unwrap();
    assert!((report.proposed.cpu_alert - 60.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn decider_uses_lowered_alert_during_monitor_streak() {
    let events = Arc::new(EventStore::in_memory(100, DEFAULT_MAX_BYTES));
    let handle = ThresholdHandle::new(Thresholds::default(), "unused.toml");
    let decider = RuleBasedDecider::new(handle)
        .with_adjuster(AdaptiveThresholdAdjuster::new(Arc::clone(&events)));
    let ctx = DecisionContext::from_value(json!({ "status": { "cpu": 75.0 } }));

    assert_eq!(decider.decide(&ctx).await.unwrap().decision, "monitor");

    monitor_streak(&events);
    let decision = decider.decide(&ctx).await.unwrap();
    assert_eq!(decision.decision, "reduce_load");
    assert!((decision.confidence - 0.75).abs() < f64::EPSILON);
    assert_eq!(decision.justification, "cpu=75, severity=none");
}
