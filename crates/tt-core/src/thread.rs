use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Stalled,
    Resolved,
}

impl Default for ThreadStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl ThreadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreadStatus::Active => "active",
            ThreadStatus::Stalled => "stalled",
            ThreadStatus::Resolved => "resolved",
        }
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "active" => Ok(ThreadStatus::Active),
            "stalled" => Ok(ThreadStatus::Stalled),
            "resolved" | "done" | "closed" => Ok(ThreadStatus::Resolved),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

/// One conversational thread as observed in the source and as persisted
/// under the `threads` key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    #[serde(deserialize_with = "deserialize_id")]
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub last_activity: DateTime<Utc>,
    #[serde(default)]
    pub participants: BTreeSet<String>,
    #[serde(default, deserialize_with = "deserialize_status")]
    pub status: ThreadStatus,
}

impl ThreadRecord {
    pub fn new(id: impl Into<String>, subject: impl Into<String>, last_activity: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            subject: subject.into(),
            last_activity,
            participants: BTreeSet::new(),
            status: ThreadStatus::Active,
        }
    }

    pub fn with_participants<I, S>(mut self, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.participants = participants.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_status(mut self, status: ThreadStatus) -> Self {
        self.status = status;
        self
    }

    /// Notification identity shared by every alert about this thread.
    pub fn dedup_key(&self) -> String {
        dedup_key(&self.id)
    }

    pub fn days_since_activity(&self, now: DateTime<Utc>) -> i64 {
        days_since_activity(self.last_activity, now)
    }
}

pub fn dedup_key(thread_id: &str) -> String {
    format!("thread-{thread_id}")
}

pub fn stall_threshold(days: u32) -> Duration {
    Duration::days(i64::from(days.max(1)))
}

/// Derives the status of a thread from its persisted state and `now`.
///
/// `Resolved` is an explicit override and is returned unchanged; every other
/// state is recomputed from elapsed inactivity. Activity stamped in the future
/// counts as no elapsed time.
pub fn derive_status(
    current: ThreadStatus,
    last_activity: DateTime<Utc>,
    threshold: Duration,
    now: DateTime<Utc>,
) -> ThreadStatus {
    if current == ThreadStatus::Resolved {
        return ThreadStatus::Resolved;
    }
    if now.signed_duration_since(last_activity) >= threshold {
        ThreadStatus::Stalled
    } else {
        ThreadStatus::Active
    }
}

pub fn days_since_activity(last_activity: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let elapsed_ms = now
        .signed_duration_since(last_activity)
        .num_milliseconds()
        .abs();
    (elapsed_ms + DAY_MS - 1) / DAY_MS
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThreadParseError {
    #[error("snapshot entry {index} is not an object")]
    NotAnObject { index: usize },
    #[error("snapshot entry {index} has no usable id")]
    MissingId { index: usize },
    #[error("snapshot entry {index} ({id}) has unparseable lastActivity: {reason}")]
    InvalidTimestamp {
        index: usize,
        id: String,
        reason: String,
    },
    #[error("snapshot entry {index} ({id}) is malformed: {reason}")]
    Malformed {
        index: usize,
        id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSnapshot {
    pub records: Vec<ThreadRecord>,
    pub dropped: Vec<ThreadParseError>,
}

/// Parses raw snapshot entries one by one so a malformed entry only costs
/// itself.
pub fn parse_snapshot(entries: Vec<Value>) -> ParsedSnapshot {
    let mut parsed = ParsedSnapshot::default();
    for (index, entry) in entries.into_iter().enumerate() {
        match parse_entry(index, entry) {
            Ok(record) => parsed.records.push(record),
            Err(err) => parsed.dropped.push(err),
        }
    }
    parsed
}

fn parse_entry(index: usize, entry: Value) -> Result<ThreadRecord, ThreadParseError> {
    let Some(object) = entry.as_object() else {
        return Err(ThreadParseError::NotAnObject { index });
    };
    let id = object
        .get("id")
        .and_then(id_from_value)
        .ok_or(ThreadParseError::MissingId { index })?;
    match object.get("lastActivity") {
        Some(raw) => {
            timestamp_from_value(raw).map_err(|reason| ThreadParseError::InvalidTimestamp {
                index,
                id: id.clone(),
                reason,
            })?;
        }
        None => {
            return Err(ThreadParseError::InvalidTimestamp {
                index,
                id,
                reason: "missing".to_string(),
            })
        }
    }
    serde_json::from_value(entry).map_err(|err| ThreadParseError::Malformed {
        index,
        id,
        reason: err.to_string(),
    })
}

fn id_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn timestamp_from_value(value: &Value) -> Result<DateTime<Utc>, String> {
    let ts = match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| format!("'{s}': {err}")),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| format!("epoch millis out of range: {n}")),
        other => Err(format!("expected string or number, found {other}")),
    }?;
    // Stored records are written back as RFC 3339, which only covers four-digit years.
    if !(0..=9999).contains(&ts.year()) {
        return Err(format!("year {} outside 0..=9999", ts.year()));
    }
    Ok(ts)
}

/// Deserialize an ID that can be either a string or a number into a String
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    id_from_value(&val).ok_or_else(|| serde::de::Error::custom("expected string or number for id"))
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    timestamp_from_value(&val).map_err(serde::de::Error::custom)
}

// Observers may report source-specific labels; anything unknown is treated
// as plain activity since status is derived on the coordinator side.
fn deserialize_status<'de, D>(deserializer: D) -> Result<ThreadStatus, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Option::<Value>::deserialize(deserializer)?;
    Ok(val
        .as_ref()
        .and_then(Value::as_str)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default())
}
