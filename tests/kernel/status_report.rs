use std::sync::Arc;

use tempfile::TempDir;

use loopguard::decision::DecisionContext;
use loopguard::error::DecisionError;
use loopguard::kernel::HealthLevel;
use loopguard::runtime::{self, HealthRegistry, Monitor, ObservedStatus, StatusReport};
use loopguard::thresholds::{ThresholdHandle, Thresholds};

use crate::kernel_harness::{ScriptedDecider, build_kernel, test_config};

fn monitor_for(config: &loopguard::Config, kernel: loopguard::Kernel) -> Monitor {
    Monitor::new(
        config,
        Arc::new(kernel),
        Arc::new(HealthRegistry::new()),
        ThresholdHandle::new(Thresholds::default(), config.thresholds_file()),
    )
}

#[tokio::test]
async fn status_reflects_a_degraded_loop() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.circuit.failure_threshold = 100;
    let (kernel, _) = build_kernel(
        &config,
        ScriptedDecider::new(vec![Err(DecisionError::CognitiveOverload("busy".into()))]),
    );
    kernel.tick(&DecisionContext::new()).await.unwrap_err();
    assert!(kernel.health_status().degraded_mode);
    monitor_for(&config, kernel).run_once();

    let observer = runtime::assemble(&config).unwrap().kernel;
    assert!(!observer.health_status().degraded_mode);

    let observed = runtime::observe_status(&config, &observer).unwrap();
    let ObservedStatus::Recorded(report) = &observed else {
        panic!("expected the recorded status, got {observed:?}");
    };
    assert!(report.running);
    assert!(!report.is_stale());
    assert!(observed.health().degraded_mode);
    assert_eq!(observed.health().level, HealthLevel::Degraded);
    assert_eq!(observed.health().recovery.escalated_count, 1);
}

#[tokio::test]
async fn status_reflects_a_loop_waiting_for_reboot() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let (kernel, _) = build_kernel(
        &config,
        ScriptedDecider::new(vec![Err(DecisionError::Unexpected("segfault".into()))]),
    );
    kernel.tick(&DecisionContext::new()).await.unwrap_err();
    monitor_for(&config, kernel).finish();

    let observer = runtime::assemble(&config).unwrap().kernel;
    let observed = runtime::observe_status(&config, &observer).unwrap();
    assert!(observed.health().reboot_required);
    assert_eq!(observed.health().level, HealthLevel::Critical);

    let report = StatusReport::read(&config.status_file()).unwrap().unwrap();
    assert!(!report.running);
    assert!(!report.is_stale());
}

#[test]
fn without_a_status_file_the_view_is_in_process() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let observer = runtime::assemble(&config).unwrap().kernel;

    let observed = runtime::observe_status(&config, &observer).unwrap();
    assert!(matches!(observed, ObservedStatus::InProcess { .. }));
    assert_eq!(observed.health().level, HealthLevel::Healthy);

    let json = serde_json::to_value(&observed).unwrap();
    assert_eq!(json["source"], "in_process");
}
