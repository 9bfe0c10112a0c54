//! Durable key-value persistence for the `threads` collection and the user
//! `settings`. The store holds no business logic; the coordinator is the only
//! writer of `threads`.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, STORE_SCHEMA_VERSION};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use tt_core::{Settings, ThreadRecord};

pub const THREADS_KEY: &str = "threads";
pub const SETTINGS_KEY: &str = "settings";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

/// Async key-value contract. Every call is a suspension point; callers must
/// not assume completion order across concurrent calls.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitReport {
    pub created_settings: bool,
    pub created_threads: bool,
}

/// First-run initialization: writes default settings and an empty thread
/// collection when absent. Existing values are left untouched.
pub async fn initialize(store: &dyn Store) -> Result<InitReport, StoreError> {
    let mut report = InitReport::default();
    if store.get(SETTINGS_KEY).await?.is_none() {
        save_settings(store, &Settings::default()).await?;
        report.created_settings = true;
    }
    if store.get(THREADS_KEY).await?.is_none() {
        store.set(THREADS_KEY, Value::Array(Vec::new())).await?;
        report.created_threads = true;
    }
    Ok(report)
}

/// Loads the stored collection. A record that no longer parses is logged and
/// skipped so one bad entry cannot block every later merge.
pub async fn load_threads(store: &dyn Store) -> Result<Vec<ThreadRecord>, StoreError> {
    let entries: Vec<Value> = match store.get(THREADS_KEY).await? {
        Some(value) => serde_json::from_value(value)
            .map_err(|err| StoreError::Serialization(err.to_string()))?,
        None => return Ok(Vec::new()),
    };
    let mut threads = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        match serde_json::from_value::<ThreadRecord>(entry) {
            Ok(record) => threads.push(record),
            Err(err) => {
                warn!(event = "stored_thread_skipped", index, error = %err);
            }
        }
    }
    Ok(threads)
}

/// Persists the collection sorted by id so equal states serialize equally.
pub async fn save_threads(store: &dyn Store, threads: &[ThreadRecord]) -> Result<(), StoreError> {
    let mut ordered = threads.iter().collect::<Vec<_>>();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));
    let value =
        serde_json::to_value(ordered).map_err(|err| StoreError::Serialization(err.to_string()))?;
    store.set(THREADS_KEY, value).await
}

pub async fn load_settings(store: &dyn Store) -> Result<Settings, StoreError> {
    match store.get(SETTINGS_KEY).await? {
        Some(value) => {
            serde_json::from_value(value).map_err(|err| StoreError::Serialization(err.to_string()))
        }
        None => Ok(Settings::default()),
    }
}

pub async fn save_settings(store: &dyn Store, settings: &Settings) -> Result<(), StoreError> {
    let value =
        serde_json::to_value(settings).map_err(|err| StoreError::Serialization(err.to_string()))?;
    store.set(SETTINGS_KEY, value).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tt_core::ScanFrequency;

    #[tokio::test]
    async fn initialize_writes_defaults_on_first_run() {
        let store = MemoryStore::new();
        let report = initialize(&store).await.expect("initialize");
        assert!(report.created_settings);
        assert!(report.created_threads);

        let settings = load_settings(&store).await.expect("settings");
        assert!(settings.notifications_enabled);
        assert_eq!(settings.stalled_threshold_days, 5);
        assert_eq!(settings.scan_frequency, ScanFrequency::Daily);
        assert_eq!(store.get(THREADS_KEY).await.expect("threads"), Some(json!([])));
    }

    #[tokio::test]
    async fn initialize_keeps_existing_settings() {
        let store = MemoryStore::new();
        store
            .set(SETTINGS_KEY, json!({"notificationsEnabled": false, "stalledThresholdDays": 2}))
            .await
            .expect("seed");

        let report = initialize(&store).await.expect("initialize");
        assert!(!report.created_settings);
        assert!(report.created_threads);

        let settings = load_settings(&store).await.expect("settings");
        assert!(!settings.notifications_enabled);
        assert_eq!(settings.stalled_threshold_days, 2);
    }

    #[tokio::test]
    async fn missing_settings_read_as_defaults() {
        let store = MemoryStore::new();
        assert_eq!(load_settings(&store).await.expect("settings"), Settings::default());
        assert!(load_threads(&store).await.expect("threads").is_empty());
    }

    #[tokio::test]
    async fn threads_are_saved_in_id_order() {
        let store = MemoryStore::new();
        let ts = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");
        let threads = vec![
            ThreadRecord::new("b", "second", ts),
            ThreadRecord::new("a", "first", ts),
        ];
        save_threads(&store, &threads).await.expect("save");

        let loaded = load_threads(&store).await.expect("load");
        assert_eq!(
            loaded.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn unreadable_stored_records_are_skipped() {
        let store = MemoryStore::new();
        store
            .set(
                THREADS_KEY,
                json!([
                    {"id": "big", "lastActivity": "+10000-01-01T00:00:00Z"},
                    {"id": "1", "subject": "Status", "lastActivity": "2026-03-01T09:00:00Z"}
                ]),
            )
            .await
            .expect("seed");

        let loaded = load_threads(&store).await.expect("load");
        assert_eq!(
            loaded.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            vec!["1"]
        );
    }

    #[tokio::test]
    async fn write_failure_surfaces_as_unavailable() {
        let store = MemoryStore::new();
        store.set_fail_writes(true);
        let result = save_settings(&store, &Settings::default()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(store.get(SETTINGS_KEY).await.expect("read"), None);
    }
}
