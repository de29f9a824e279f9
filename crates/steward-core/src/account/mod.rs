//! Account records and the shared registry.

mod record;
mod registry;

pub use record::{
    AccountRecord, BuildTarget, CyclePhase, FeatureConfig, LogEntry, LogLevel, Population,
    Resources, RunStatus, MAX_LOG_ENTRIES,
};
pub use registry::{AccountRegistry, CycleLog};
