pub mod config;
pub mod ipc;
pub mod settings;
pub mod thread;

pub use settings::{ScanFrequency, Settings, SettingsError, SettingsPatch};
pub use thread::{
    days_since_activity, dedup_key, derive_status, parse_snapshot, stall_threshold,
    ParsedSnapshot, ThreadParseError, ThreadRecord, ThreadStatus,
};
