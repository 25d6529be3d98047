use std::fs;

use tempfile::TempDir;

use loopguard::KernelError;
use loopguard::decision::DecisionContext;
use loopguard::error::DecisionError;
use loopguard::failsafe::{FailsafeManager, FailsafeOutcome, validate_state_file};
use loopguard::kernel::DecisionSource;
use loopguard::recovery::ErrorType;
use loopguard::utils::fs::timestamped_path;

use crate::kernel_harness::{ScriptedDecider, build_kernel, ok, test_config, write_state};

#[tokio::test]
async fn corrupted_state_is_restored_and_served_as_fallback() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let backup = timestamped_path(&config.backup_dir(), "decision_state", "toml");
    write_state(&backup, "reduce_load", 0.8);
    fs::write(config.state_file(), "[decision]\nlast_decision = ").unwrap();

    let (kernel, _) = build_kernel(
        &config,
        ScriptedDecider::new(vec![Err(DecisionError::CognitiveOverload("busy".into()))]),
    );
    let outcome = kernel.bootstrap().unwrap();
    assert_eq!(outcome, FailsafeOutcome::Restored { from: backup.clone() });
    assert_eq!(fs::read(&backup).unwrap(), fs::read(config.state_file()).unwrap());

    let log = fs::read_to_string(config.failure_log()).unwrap();
    assert!(log.contains("## "));
    assert!(log.contains("State restored from backup"));

    let served = kernel.tick(&DecisionContext::new()).await.unwrap();
    assert_eq!(served.source, DecisionSource::Fallback);
    assert_eq!(served.decision, "reduce_load");
    assert!(served.degraded);
}

#[tokio::test]
async fn corrupted_state_without_backup_refuses_to_start() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    fs::write(config.state_file(), "").unwrap();

    let (kernel, _) = build_kernel(&config, ScriptedDecider::new(vec![ok("normal", 0.4)]));
    let err = kernel.bootstrap().unwrap_err();
    assert!(matches!(
        err,
        KernelError::RecoveryFatal {
            error_type: ErrorType::StateCorrupt,
            ..
        }
    ));
    let log = fs::read_to_string(config.failure_log()).unwrap();
    assert!(log.contains("State restore failed"));
}

#[test]
fn invalid_backups_are_skipped_newest_first() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let older = timestamped_path(&config.backup_dir(), "decision_state", "toml");
    write_state(&older, "monitor", 0.6);
    let newer = timestamped_path(&config.backup_dir(), "decision_state", "toml");
    write_state(&newer, "monitor", 2.5);
    fs::write(config.state_file(), "garbage").unwrap();

    let manager = FailsafeManager::from_config(&config);
    assert!(manager.activate());
    assert_eq!(fs::read(&older).unwrap(), fs::read(config.state_file()).unwrap());
}

#[tokio::test]
async fn legacy_backup_without_offset_is_restored() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let backup = timestamped_path(&config.backup_dir(), "decision_state", "toml");
    fs::create_dir_all(config.backup_dir()).unwrap();
    fs::write(
        &backup,
        "[decision]\nlast_decision = \"monitor\"\nconfidence_score = 0.6\n\
         justification = \"legacy\"\ntimestamp = \"2025-06-22T14:03:11.123456\"\n",
    )
    .unwrap();
    assert!(validate_state_file(&backup).is_ok());
    fs::write(config.state_file(), "[health]\nis_healthy = false\n").unwrap();

    let manager = FailsafeManager::from_config(&config);
    assert!(manager.activate());
    assert_eq!(fs::read(&backup).unwrap(), fs::read(config.state_file()).unwrap());

    let (kernel, _) = build_kernel(&config, ScriptedDecider::new(vec![ok("normal", 0.4)]));
    assert_eq!(kernel.bootstrap().unwrap(), FailsafeOutcome::Valid);
    assert_eq!(kernel.state_store().load().unwrap().last_decision, "monitor");
}

#[test]
fn activate_is_false_on_a_fresh_install() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    let manager = FailsafeManager::from_config(&config);
    assert_eq!(manager.inspect().unwrap(), FailsafeOutcome::Fresh);
    assert!(!manager.activate());
    assert!(FailsafeOutcome::Fresh.allows_start());
}

#[tokio::test]
async fn stray_temp_file_never_replaces_live_state() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    write_state(&config.state_file(), "normal", 0.4);
    let stray = config.state_file().with_file_name(".decision_state.toml.999999.tmp");
    fs::write(&stray, "[decision]\nlast_decision = \"half-writ").unwrap();

    let (kernel, _) = build_kernel(&config, ScriptedDecider::new(vec![ok("monitor", 0.6)]));
    assert_eq!(kernel.bootstrap().unwrap(), FailsafeOutcome::Valid);
    kernel.tick(&DecisionContext::new()).await.unwrap();

    validate_state_file(&config.state_file()).unwrap();
    assert_eq!(kernel.state_store().load().unwrap().last_decision, "monitor");
}

#[tokio::test]
async fn backups_follow_the_cadence_and_are_pruned() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.backup.every_ticks = 2;
    config.backup.keep = 2;
    let (kernel, _) = build_kernel(&config, ScriptedDecider::new(vec![ok("normal", 0.4)]));
    let ctx = DecisionContext::new();

    for _ in 0..7 {
        kernel.tick(&ctx).await.unwrap();
    }
    let backups = kernel.failsafe().list_backups().unwrap();
    assert_eq!(backups.len(), 2);
    for backup in &backups {
        validate_state_file(backup).unwrap();
    }
}
