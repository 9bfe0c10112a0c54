use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;
use tt_core::{parse_snapshot, ThreadRecord};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Where an observer gets the threads it can currently see. A scan returns
/// a replace-candidate set, not an exhaustive listing.
#[async_trait]
pub trait ThreadSource: Send + Sync {
    async fn scan(&self) -> Result<Vec<ThreadRecord>, SourceError>;
}

/// Fixed set of records, replaceable at runtime.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    threads: Arc<RwLock<Vec<ThreadRecord>>>,
}

impl StaticSource {
    pub fn new(threads: Vec<ThreadRecord>) -> Self {
        Self {
            threads: Arc::new(RwLock::new(threads)),
        }
    }

    pub async fn replace(&self, threads: Vec<ThreadRecord>) {
        *self.threads.write().await = threads;
    }
}

#[async_trait]
impl ThreadSource for StaticSource {
    async fn scan(&self) -> Result<Vec<ThreadRecord>, SourceError> {
        Ok(self.threads.read().await.clone())
    }
}

/// Reads a JSON array of thread records on every scan. Entries that fail
/// validation are logged and skipped.
#[derive(Debug, Clone)]
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ThreadSource for JsonFileSource {
    async fn scan(&self) -> Result<Vec<ThreadRecord>, SourceError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|source| SourceError::Io {
                path: self.path.clone(),
                source,
            })?;
        let entries: Vec<Value> =
            serde_json::from_slice(&raw).map_err(|err| SourceError::Parse {
                path: self.path.clone(),
                reason: err.to_string(),
            })?;
        let parsed = parse_snapshot(entries);
        for err in &parsed.dropped {
            warn!(event = "source_entry_skipped", path = %self.path.display(), error = %err);
        }
        Ok(parsed.records)
    }
}

/// Demo mailbox: one recent thread and two long-idle ones.
pub fn sample_threads(now: DateTime<Utc>) -> Vec<ThreadRecord> {
    vec![
        ThreadRecord::new("1", "Project Status Update", now - Duration::days(1))
            .with_participants(["john.doe@example.com", "jane.smith@example.com"]),
        ThreadRecord::new("2", "Budget Approval Request", now - Duration::days(5))
            .with_participants(["finance@example.com", "your.email@example.com"]),
        ThreadRecord::new("3", "Meeting Schedule for Next Week", now - Duration::days(7))
            .with_participants(["team@example.com", "your.email@example.com"]),
    ]
}
