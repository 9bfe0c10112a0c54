use crate::{Store, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub const STORE_SCHEMA_VERSION: i64 = 1;

/// SQLite-backed durable store. The connection is shared behind a mutex and
/// every statement runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StoreError::Unavailable(err.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn schema_version(&self) -> Result<i64, StoreError> {
        self.run(schema_version).await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| StoreError::Unavailable("connection lock poisoned".to_string()))?;
            f(&*guard)
        })
        .await
        .map_err(|err| StoreError::Unavailable(err.to_string()))?
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let key = key.to_string();
        self.run(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value_json FROM kv_entries WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|text| {
                serde_json::from_str(&text).map_err(|err| StoreError::Serialization(err.to_string()))
            })
            .transpose()
        })
        .await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let key = key.to_string();
        let value_json =
            serde_json::to_string(&value).map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.run(move |conn| {
            conn.execute(
                "
                INSERT INTO kv_entries (key, value_json, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(key) DO UPDATE SET
                    value_json=excluded.value_json,
                    updated_at=excluded.updated_at
                ",
                params![key, value_json, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
        .await
    }
}

fn schema_version(conn: &Connection) -> Result<i64, StoreError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    let current = schema_version(conn)?;
    if current > STORE_SCHEMA_VERSION {
        return Err(StoreError::UnsupportedSchemaVersion {
            found: current,
            supported: STORE_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        let sql = include_str!("../migrations/0001_kv_store.sql");
        conn.execute_batch(sql)?;
        conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{initialize, load_settings, load_threads, save_threads, THREADS_KEY};
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;
    use tt_core::ThreadRecord;

    #[tokio::test]
    async fn migration_sets_schema_version() {
        let store = SqliteStore::open_in_memory().expect("open db");
        assert_eq!(
            store.schema_version().await.expect("schema version"),
            STORE_SCHEMA_VERSION
        );
    }

    #[tokio::test]
    async fn get_set_round_trip_and_overwrite() {
        let store = SqliteStore::open_in_memory().expect("open db");
        assert_eq!(store.get("missing").await.expect("get"), None);

        store.set("k", json!({"a": 1})).await.expect("set");
        store.set("k", json!({"a": 2})).await.expect("overwrite");
        assert_eq!(store.get("k").await.expect("get"), Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("nested").join("threads.sqlite");
        let ts = Utc
            .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
            .single()
            .expect("valid timestamp");

        {
            let store = SqliteStore::open(&path).expect("open db");
            let report = initialize(&store).await.expect("initialize");
            assert!(report.created_settings);
            save_threads(&store, &[ThreadRecord::new("1", "Project Status Update", ts)])
                .await
                .expect("save");
        }

        let store = SqliteStore::open(&path).expect("reopen db");
        let report = initialize(&store).await.expect("initialize again");
        assert!(!report.created_settings);
        assert!(!report.created_threads);

        let threads = load_threads(&store).await.expect("threads");
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].subject, "Project Status Update");
        assert_eq!(threads[0].last_activity, ts);
        assert!(load_settings(&store).await.expect("settings").notifications_enabled);
        assert!(store.get(THREADS_KEY).await.expect("raw").is_some());
    }
}
