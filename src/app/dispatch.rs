use crate::app::status::render_status;
use crate::cli::commands::{Cli, Commands, EventCommands, ThresholdCommands};
use anyhow::{Context, Result, bail};
use loopguard::Config;
use loopguard::events::{EventStore, EventType};
use loopguard::failsafe::{FailsafeManager, FailsafeOutcome};
use loopguard::runtime::{self, Assembly};
use loopguard::snapshot::{FailsafeHook, SnapshotManager};
use loopguard::thresholds::{AdaptiveThresholdAdjuster, AdjustmentReport, ThresholdHandle};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

fn parse_kind(kind: Option<&str>) -> Result<Option<EventType>> {
    kind.map(|k| EventType::from_str(k).with_context(|| format!("Unknown event type '{k}'")))
        .transpose()
}

fn open_events(config: &Config) -> Result<EventStore> {
    EventStore::from_config(config)
        .with_context(|| format!("Failed to open event log {}", config.events_file().display()))
}

fn print_report(report: &AdjustmentReport) {
    println!(
        "cpu_alert {:.2} -> {:.2} ({}; {} of last {} decisions were \"monitor\")",
        report.current.cpu_alert,
        report.proposed.cpu_alert,
        report.trigger,
        report.monitor_count,
        report.window
    );
    if !report.changed {
        println!("No change proposed.");
    } else if report.applied {
        println!("Applied.");
    } else {
        println!("Dry run; pass --apply to save.");
    }
}

pub async fn dispatch(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run { ticks } => {
            let report = runtime::run(&config, ticks).await?;
            println!(
                "Stopped after {} ticks: {} decisions, {} fallbacks, {} blocked, {} failed",
                report.ticks, report.decisions, report.fallbacks, report.blocked, report.failed
            );
            Ok(())
        }

        Commands::Status { json } => {
            let Assembly { kernel, thresholds } = runtime::assemble(&config)?;
            let observed = runtime::observe_status(&config, &kernel)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&observed)?);
            } else {
                let last = kernel.state_store().load().ok();
                println!(
                    "{}",
                    render_status(&config, &observed, last.as_ref(), &thresholds.load())
                );
            }
            Ok(())
        }

        Commands::Failsafe => {
            let manager = FailsafeManager::from_config(&config);
            match manager.inspect()? {
                FailsafeOutcome::Valid => println!("State file is valid."),
                FailsafeOutcome::Restored { from } => {
                    println!("State restored from {}", from.display());
                }
                FailsafeOutcome::Fresh => bail!("No state file and no backups to restore from"),
                FailsafeOutcome::Unrecoverable { reason } => {
                    bail!("State is unrecoverable: {reason}")
                }
            }
            Ok(())
        }

        Commands::Snapshot {
            input,
            output,
            no_fallback,
        } => {
            let manager = Arc::new(FailsafeManager::from_config(&config));
            let snapshots =
                SnapshotManager::from_config(&config, FailsafeHook::from_config(&config, manager));
            if snapshots
                .generate(input.as_deref(), output.as_deref(), !no_fallback)
                .await
            {
                let path = output.unwrap_or_else(|| config.snapshot_file());
                println!("Snapshot written to {}", path.display());
                Ok(())
            } else {
                bail!("Snapshot generation failed")
            }
        }

        Commands::Rollback => {
            let Assembly { kernel, .. } = runtime::assemble(&config)?;
            if kernel.rollback() {
                println!("Rolled back to the previous backup.");
                Ok(())
            } else {
                bail!("No earlier backup to roll back to")
            }
        }

        Commands::Events { event_command } => {
            let events = open_events(&config)?;
            match event_command {
                EventCommands::Query {
                    kind,
                    since_minutes,
                } => {
                    let kind = parse_kind(kind.as_deref())?;
                    for event in events.query(kind, since_minutes) {
                        println!("{}", serde_json::to_string(&event)?);
                    }
                }
                EventCommands::Cleanup { older_than_days } => {
                    let days = older_than_days.unwrap_or(config.events.retention_days);
                    let deleted = events.cleanup(days);
                    println!("Deleted {deleted} events older than {days} days.");
                }
                EventCommands::Anomalies { window_minutes } => {
                    let window = window_minutes.unwrap_or(config.monitor.anomaly_window_minutes);
                    let anomalies = events.detect_anomalies(window);
                    if anomalies.is_empty() {
                        println!("No anomalies in the last {window} minutes.");
                    }
                    for anomaly in anomalies {
                        println!(
                            "{} [{}] {} events in {} minutes",
                            anomaly.kind, anomaly.severity, anomaly.count, anomaly.window_minutes
                        );
                    }
                }
                EventCommands::Export { path, kind } => {
                    let kind = parse_kind(kind.as_deref())?;
                    let count = events
                        .export(&path, kind)
                        .with_context(|| format!("Failed to export to {}", path.display()))?;
                    info!(count, path = %path.display(), "events exported");
                    println!("Exported {count} events to {}", path.display());
                }
            }
            Ok(())
        }

        Commands::Thresholds { threshold_command } => {
            let handle = ThresholdHandle::open(config.thresholds_file())?;
            match threshold_command {
                ThresholdCommands::Show => {
                    print!("{}", toml::to_string_pretty(&*handle.load_full())?);
                }
                ThresholdCommands::Adjust { feedback, apply } => {
                    if !matches!(feedback.as_str(), "increase" | "decrease") {
                        bail!("--feedback must be 'increase' or 'decrease', got '{feedback}'");
                    }
                    let adjuster = AdaptiveThresholdAdjuster::new(Arc::new(open_events(&config)?));
                    print_report(&adjuster.apply_feedback(&handle, &feedback, apply)?);
                }
                ThresholdCommands::Tune { apply } => {
                    let adjuster = AdaptiveThresholdAdjuster::new(Arc::new(open_events(&config)?));
                    print_report(&adjuster.run_cycle(&handle, apply)?);
                }
            }
            Ok(())
        }
    }
}
