mod loader;
pub mod schema;

pub use loader::load_from_path;
pub use schema::{
    BackupConfig, CircuitConfig, Config, DegradationConfig, EventsConfig, FailsafeMode,
    LoopConfig, MonitorConfig, PathsConfig, RecoveryConfig, SnapshotConfig,
};
