use serde_json::json;

use loopguard::events::{AnomalyKind, DEFAULT_MAX_BYTES, EventStore, EventType};
use loopguard::recovery::Severity;

fn sequence(store: &EventStore) -> Vec<u64> {
    store
        .query(None, None)
        .iter()
        .filter_map(|e| e.payload.get("n").and_then(serde_json::Value::as_u64))
        .collect()
}

#[test]
fn count_cap_evicts_oldest_first() {
    let store = EventStore::in_memory(5, DEFAULT_MAX_BYTES);
    for n in 0..8u64 {
        store.append(EventType::Decision, "test", json!({ "n": n }));
    }

    assert_eq!(store.len(), 5);
    assert_eq!(sequence(&store), vec![3, 4, 5, 6, 7]);
}

#[test]
fn byte_cap_keeps_newest_event() {
    let store = EventStore::in_memory(1_000, 400);
    for n in 0..20u64 {
        store.append(EventType::Error, "test", json!({ "n": n, "pad": "x".repeat(40) }));
    }

    assert!(store.total_bytes() <= 400);
    assert_eq!(sequence(&store).last(), Some(&19));

    let huge = EventStore::in_memory(1_000, 10);
    huge.append(EventType::Error, "test", json!({ "pad": "y".repeat(100) }));
    assert_eq!(huge.len(), 1);
}

#[test]
fn queries_filter_by_type_and_preserve_order() {
    let store = EventStore::in_memory(100, DEFAULT_MAX_BYTES);
    let first = store.append(EventType::Decision, "test", json!({ "n": 1 }));
    store.append(EventType::Error, "test", json!({ "n": 2 }));
    let third = store.append(EventType::Decision, "test", json!({ "n": 3 }));

    let decisions = store.query(Some(EventType::Decision), Some(5));
    assert_eq!(
        decisions.iter().map(|e| e.id).collect::<Vec<_>>(),
        vec![first, third]
    );
    assert!(first < third);
}

#[test]
fn cleanup_records_maintenance_event() {
    let store = EventStore::in_memory(100, DEFAULT_MAX_BYTES);
    store.append(EventType::Decision, "test", json!({}));

    assert_eq!(store.cleanup(30), 0);
    let maintenance = store.latest(EventType::Maintenance).unwrap();
    assert_eq!(maintenance.payload_str("action"), Some("cleanup"));
    assert_eq!(store.len(), 2);
}

#[test]
fn anomaly_rules_use_strict_thresholds() {
    let store = EventStore::in_memory(100, DEFAULT_MAX_BYTES);
    for _ in 0..5 {
        store.append(EventType::Error, "test", json!({}));
    }
    for _ in 0..3 {
        store.append(EventType::SystemError, "test", json!({}));
    }
    for _ in 0..4 {
        store.append(EventType::Contradiction, "test", json!({}));
    }

    let anomalies = store.detect_anomalies(60);
    let kinds: Vec<_> = anomalies.iter().map(|a| (a.kind, a.severity)).collect();
    assert_eq!(
        kinds,
        vec![
            (AnomalyKind::SystemErrors, Severity::Critical),
            (AnomalyKind::HighContradictions, Severity::Medium),
        ]
    );

    store.append(EventType::Error, "test", json!({}));
    assert!(
        store
            .detect_anomalies(60)
            .iter()
            .any(|a| a.kind == AnomalyKind::HighFailureRate && a.severity == Severity::High)
    );
}
