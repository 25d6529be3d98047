use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// `loopguard` - resilience kernel for periodic decision loops.
#[derive(Parser, Debug)]
#[command(name = "loopguard")]
#[command(author = "theonlyhennygod")]
#[command(version = "0.1.0")]
#[command(about = "Circuit breaking, recovery and failsafe state for decision loops.", long_about = None)]
pub struct Cli {
    /// Config file (default: ~/.loopguard/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at DEBUG instead of INFO
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the decision loop until Ctrl-C (or --ticks)
    Run {
        /// Stop after this many ticks
        #[arg(long)]
        ticks: Option<u64>,
    },

    /// Show kernel health, circuit state and recovery metrics
    Status {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Verify the state file and restore the newest valid backup if needed
    Failsafe,

    /// Write a validated snapshot of the state file
    Snapshot {
        /// State file to read (default: configured state file)
        #[arg(long)]
        input: Option<PathBuf>,

        /// Snapshot file to write (default: configured snapshot file)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Do not run the failsafe when the snapshot fails
        #[arg(long)]
        no_fallback: bool,
    },

    /// Restore the previous state backup over the live state
    Rollback,

    /// Query and maintain the event log
    Events {
        #[command(subcommand)]
        event_command: EventCommands,
    },

    /// Inspect and tune decision thresholds
    Thresholds {
        #[command(subcommand)]
        threshold_command: ThresholdCommands,
    },
}

/// Event log subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum EventCommands {
    /// List events, oldest first
    Query {
        /// Event type (DECISION, ERROR, CONTRADICTION, ...)
        #[arg(long)]
        kind: Option<String>,

        /// Only events from the last M minutes
        #[arg(long)]
        since_minutes: Option<u64>,
    },
    /// Delete events older than the retention period
    Cleanup {
        /// Override events.retention_days
        #[arg(long)]
        older_than_days: Option<u32>,
    },
    /// Report error, system-error and contradiction bursts
    Anomalies {
        /// Override monitor.anomaly_window_minutes
        #[arg(long)]
        window_minutes: Option<u64>,
    },
    /// Write events to a JSON export file
    Export {
        /// Destination file
        path: PathBuf,

        /// Only events of this type
        #[arg(long)]
        kind: Option<String>,
    },
}

/// Threshold subcommands
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum ThresholdCommands {
    /// Print the current thresholds
    Show,
    /// Scale cpu_alert by operator feedback (increase / decrease)
    Adjust {
        #[arg(long)]
        feedback: String,

        /// Save the result (default is a dry run)
        #[arg(long)]
        apply: bool,
    },
    /// Lower cpu_alert when recent decisions are mostly "monitor"
    Tune {
        /// Save the result (default is a dry run)
        #[arg(long)]
        apply: bool,
    },
}
