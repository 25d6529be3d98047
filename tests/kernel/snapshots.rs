use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use loopguard::config::Config;
use loopguard::failsafe::FailsafeManager;
use loopguard::snapshot::{FailsafeHook, SnapshotManager};
use loopguard::utils::fs::list_timestamped;

use crate::kernel_harness::test_config;

const FULL_STATE: &str = r#"
timestamp = "2026-03-01T12:00:00Z"
operator = "night-shift"

[decision]
last_decision = "reduce_load"
confidence_score = 0.8
justification = "cpu=91, severity=none"
timestamp = "2026-03-01T11:59:59Z"

[inputs.status]
cpu = 91.0
severity = "none"

[health]
is_healthy = true
error_count = 0

[performance]
cpu_usage = 91.0
memory_usage = 40.0

[circuit_breaker]
state = "CLOSED"
"#;

fn manager(config: &Config, hook: FailsafeHook) -> SnapshotManager {
    SnapshotManager::from_config(config, hook)
}

fn table(path: &Path) -> toml::Table {
    toml::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn snapshot_keeps_only_inputs_and_decision() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    fs::write(config.state_file(), FULL_STATE).unwrap();

    assert!(
        manager(&config, FailsafeHook::Disabled)
            .generate(None, None, false)
            .await
    );

    let snapshot = table(&config.snapshot_file());
    let mut keys: Vec<&str> = snapshot.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, ["decision", "inputs", "snapshot_time", "timestamp"]);
    assert_eq!(snapshot["timestamp"].as_str(), Some("2026-03-01T12:00:00Z"));
    assert_eq!(snapshot["decision"]["last_decision"].as_str(), Some("reduce_load"));

    let evolution = fs::read_to_string(config.evolution_log()).unwrap();
    assert_eq!(evolution.trim_end(), "2026-03-01T12:00:00Z :: Score: 0.8");
    assert_eq!(
        list_timestamped(&config.snapshot_history_dir(), "snapshot", "toml")
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn missing_state_yields_empty_snapshot() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let output = tmp.path().join("out").join("snap.toml");

    assert!(
        manager(&config, FailsafeHook::Disabled)
            .generate(None, Some(&output), false)
            .await
    );

    let snapshot = table(&output);
    assert!(!snapshot.contains_key("decision"));
    assert!(!snapshot.contains_key("inputs"));
    let evolution = fs::read_to_string(config.evolution_log()).unwrap();
    assert!(evolution.trim_end().ends_with(":: Score: N/A"));
}

#[tokio::test]
async fn invalid_snapshot_writes_nothing_and_runs_failsafe() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    fs::write(
        config.state_file(),
        "[decision]\nlast_decision = \"normal\"\nconfidence_score = nan\n",
    )
    .unwrap();
    let failsafe = Arc::new(FailsafeManager::from_config(&config));

    let written = manager(&config, FailsafeHook::InProcess(failsafe))
        .generate(None, None, true)
        .await;

    assert!(!written);
    assert!(!config.snapshot_file().exists());
    assert!(!config.evolution_log().exists());
    let incidents = fs::read_to_string(config.failure_log()).unwrap();
    assert!(incidents.contains("State restore failed"));
}

#[tokio::test]
async fn no_fallback_leaves_failsafe_untouched() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    fs::write(
        config.state_file(),
        "[decision]\nlast_decision = \"normal\"\nconfidence_score = nan\n",
    )
    .unwrap();
    let failsafe = Arc::new(FailsafeManager::from_config(&config));

    let written = manager(&config, FailsafeHook::InProcess(failsafe))
        .generate(None, None, false)
        .await;

    assert!(!written);
    assert!(!config.failure_log().exists());
}

#[tokio::test]
async fn history_is_pruned_to_configured_size() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.snapshot.history_keep = 3;
    fs::write(config.state_file(), FULL_STATE).unwrap();
    let snapshots = manager(&config, FailsafeHook::Disabled);

    for _ in 0..5 {
        assert!(snapshots.generate(None, None, false).await);
    }
    assert_eq!(
        list_timestamped(&config.snapshot_history_dir(), "snapshot", "toml")
            .unwrap()
            .len(),
        3
    );
    assert!(snapshots.last_snapshot_time().is_some());
}
