use std::fs::{self, OpenOptions};
use std::io::Write;

use serde_json::json;
use tempfile::TempDir;

use loopguard::events::{DEFAULT_MAX_BYTES, EventStore, EventType};

#[test]
fn reopen_replays_log_and_continues_ids() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("events.jsonl");

    let last = {
        let store = EventStore::open(&path, 100, DEFAULT_MAX_BYTES).unwrap();
        store.append(EventType::Decision, "test", json!({ "decision": "normal" }));
        store.append(EventType::Error, "test", json!({ "message": "boom" }));
        store.append(EventType::Decision, "test", json!({ "decision": "monitor" }))
    };

    let reopened = EventStore::open(&path, 100, DEFAULT_MAX_BYTES).unwrap();
    assert_eq!(reopened.len(), 3);
    let next = reopened.append(EventType::Recovery, "test", json!({}));
    assert!(next > last);
    assert_eq!(
        reopened
            .recent_decisions(5)
            .iter()
            .filter_map(|e| e.payload_str("decision"))
            .collect::<Vec<_>>(),
        vec!["normal", "monitor"]
    );
}

#[test]
fn unparseable_lines_are_skipped() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("events.jsonl");
    {
        let store = EventStore::open(&path, 100, DEFAULT_MAX_BYTES).unwrap();
        store.append(EventType::Decision, "test", json!({ "decision": "normal" }));
    }
    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(file, "{{\"id\": 99, \"type\": \"DECIS").unwrap();
    drop(file);

    let reopened = EventStore::open(&path, 100, DEFAULT_MAX_BYTES).unwrap();
    assert_eq!(reopened.len(), 1);
}

#[test]
fn heavy_eviction_compacts_the_log() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("events.jsonl");
    let store = EventStore::open(&path, 4, DEFAULT_MAX_BYTES).unwrap();
    for n in 0..10u64 {
        store.append(EventType::Decision, "test", json!({ "n": n }));
    }

    let lines = fs::read_to_string(&path).unwrap().lines().count();
    assert!(lines <= 6, "log should have been compacted, found {lines} lines");

    let reopened = EventStore::open(&path, 4, DEFAULT_MAX_BYTES).unwrap();
    assert_eq!(reopened.len(), 4);
}

#[test]
fn export_writes_filtered_document() {
    let tmp = TempDir::new().unwrap();
    let store = EventStore::in_memory(100, DEFAULT_MAX_BYTES);
    store.append(EventType::Decision, "test", json!({}));
    store.append(EventType::Error, "test", json!({}));
    store.append(EventType::Error, "test", json!({}));

    let out = tmp.path().join("export").join("errors.json");
    assert_eq!(store.export(&out, Some(EventType::Error)).unwrap(), 2);

    let document: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(document["count"], 2);
    assert_eq!(document["filter"], "ERROR");
    assert_eq!(document["events"].as_array().unwrap().len(), 2);
}
