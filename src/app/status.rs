use loopguard::Config;
use loopguard::runtime::ObservedStatus;
use loopguard::state::DecisionState;
use loopguard::thresholds::Thresholds;

fn source_line(observed: &ObservedStatus) -> String {
    match observed {
        ObservedStatus::Recorded(report) => {
            let age = report.age().num_seconds().max(0);
            if report.is_stale() {
                format!("STALE: loop last reported {age}s ago and may have died")
            } else if report.running {
                format!("running loop (reported {age}s ago)")
            } else {
                format!("stopped loop (final report {age}s ago)")
            }
        }
        ObservedStatus::InProcess { .. } => {
            "no running loop (circuit rebuilt from events; mode and reboot flag unknown)".into()
        }
    }
}

pub fn render_status(
    config: &Config,
    observed: &ObservedStatus,
    last: Option<&DecisionState>,
    thresholds: &Thresholds,
) -> String {
    let health = observed.health();
    let mut lines = vec![
        "◆ loopguard status".to_string(),
        String::new(),
        format!("Version     {}", env!("CARGO_PKG_VERSION")),
        format!("Workspace   {}", config.workspace_dir.display()),
        format!("Config      {}", config.config_path.display()),
        format!("State       {}", config.state_file().display()),
        format!("Source      {}", source_line(observed)),
        String::new(),
        format!("  Health        {}", health.level),
        format!(
            "  Circuit       {} ({} consecutive failures, threshold {})",
            health.state, health.consecutive_failures, config.circuit.failure_threshold
        ),
        format!(
            "  Mode          {}",
            if health.degraded_mode {
                "DEGRADED"
            } else {
                "NORMAL"
            }
        ),
        format!(
            "  Last snapshot {}",
            health
                .last_snapshot_time
                .map_or_else(|| "never".to_string(), |t| t.to_rfc3339())
        ),
    ];
    if health.reboot_required {
        lines.push("  Reboot        REQUIRED (restart from failsafe-verified state)".into());
    }

    lines.push(String::new());
    match last {
        Some(state) => {
            lines.push(format!(
                "  Last decision {} (confidence {:.2}) at {}",
                state.last_decision,
                state.confidence_score,
                state.timestamp.to_rfc3339()
            ));
            lines.push(format!("  Justification {}", state.justification));
        }
        None => lines.push("  Last decision (none)".to_string()),
    }

    lines.push(String::new());
    lines.push(format!(
        "  Thresholds    cpu_alert={:.1} cpu_watch={:.1} cpu_lowered_alert={:.1}",
        thresholds.cpu_alert, thresholds.cpu_watch, thresholds.cpu_lowered_alert
    ));

    let circuit = &health.circuit;
    lines.push(format!(
        "  Calls         {} total, {} ok, {} failed, {} blocked ({:.0}% success, {:.0}% failure)",
        circuit.total_calls,
        circuit.successful_calls,
        circuit.total_failures,
        circuit.blocked_calls,
        circuit.success_rate() * 100.0,
        circuit.failure_rate() * 100.0
    ));
    let recovery = &health.recovery;
    lines.push(format!(
        "  Recovery      {} attempts: {} recovered, {} escalated, {} fatal ({:.0}% recovered)",
        recovery.total_attempts,
        recovery.recovered_count,
        recovery.escalated_count,
        recovery.fatal_count,
        recovery.recovery_rate() * 100.0
    ));

    if let ObservedStatus::Recorded(report) = observed {
        for anomaly in &report.anomalies {
            lines.push(format!(
                "  Anomaly       {} ({}, {} in {} min)",
                anomaly.kind, anomaly.severity, anomaly.count, anomaly.window_minutes
            ));
        }
    }

    lines.join("\n")
}
