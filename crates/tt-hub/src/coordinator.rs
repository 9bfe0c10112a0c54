use crate::notifier::Notifier;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use tt_core::ipc::ThreadsView;
use tt_core::{
    derive_status, parse_snapshot, Settings, SettingsError, SettingsPatch, ThreadRecord,
    ThreadStatus,
};
use tt_storage::{
    initialize, load_settings, load_threads, save_settings, save_threads, InitReport, Store,
    StoreError,
};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
    #[error("unknown thread: {0}")]
    UnknownThread(String),
    #[error("invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    Stalled,
    Recovered,
    Resolved,
    Reopened,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub thread_id: String,
    pub kind: TransitionKind,
    pub from: ThreadStatus,
    pub to: ThreadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub received: usize,
    pub dropped: usize,
    pub inserted: usize,
    pub updated: usize,
    pub committed: bool,
    pub transitions: Vec<Transition>,
}

impl MergeReport {
    pub fn newly_stalled(&self) -> impl Iterator<Item = &Transition> {
        self.transitions
            .iter()
            .filter(|transition| transition.kind == TransitionKind::Stalled)
    }
}

/// Sole writer of the authoritative `threads` collection.
///
/// Every read-modify-write runs under one merge lock, so concurrent
/// snapshots from different observers cannot interleave and lose an update.
/// State is committed with a single `set` before any alert goes out; a failed
/// write leaves the store untouched and delivers nothing.
pub struct Coordinator {
    store: Arc<dyn Store>,
    notifier: Notifier,
    merge_lock: Mutex<()>,
    last_known: RwLock<Vec<ThreadRecord>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, notifier: Notifier) -> Self {
        Self {
            store,
            notifier,
            merge_lock: Mutex::new(()),
            last_known: RwLock::new(Vec::new()),
        }
    }

    pub async fn initialize(&self) -> Result<InitReport, CoordinatorError> {
        let report = initialize(self.store.as_ref()).await?;
        if report.created_settings || report.created_threads {
            info!(
                event = "store_initialized",
                created_settings = report.created_settings,
                created_threads = report.created_threads
            );
        }
        let threads = load_threads(self.store.as_ref()).await?;
        *self.last_known.write().await = threads;
        Ok(report)
    }

    pub async fn settings(&self) -> Result<Settings, CoordinatorError> {
        Ok(load_settings(self.store.as_ref()).await?)
    }

    pub async fn receive(
        &self,
        entries: Vec<Value>,
        source: &str,
    ) -> Result<MergeReport, CoordinatorError> {
        self.receive_at(entries, source, Utc::now()).await
    }

    pub async fn receive_at(
        &self,
        entries: Vec<Value>,
        source: &str,
        now: DateTime<Utc>,
    ) -> Result<MergeReport, CoordinatorError> {
        let received = entries.len();
        let parsed = parse_snapshot(entries);
        for err in &parsed.dropped {
            warn!(event = "snapshot_entry_dropped", source = source, error = %err);
        }

        let _guard = self.merge_lock.lock().await;
        let (settings, before) = self.load_state().await?;
        let mut threads = before.clone();
        let mut report = MergeReport {
            received,
            dropped: parsed.dropped.len(),
            ..MergeReport::default()
        };

        for incoming in parsed.records {
            match threads.get_mut(&incoming.id) {
                Some(existing) => {
                    if merge_into(existing, incoming) {
                        report.updated += 1;
                    }
                }
                None => {
                    let mut record = incoming;
                    if record.status != ThreadStatus::Resolved {
                        record.status = ThreadStatus::Active;
                    }
                    report.inserted += 1;
                    threads.insert(record.id.clone(), record);
                }
            }
        }

        rederive(&mut threads, &settings, now);
        report.transitions = detect_transitions(&before, &threads);
        report.committed = self.commit(&before, &threads).await?;

        info!(
            event = "snapshot_merged",
            source = source,
            received = report.received,
            dropped = report.dropped,
            inserted = report.inserted,
            updated = report.updated,
            transitions = report.transitions.len(),
            committed = report.committed
        );

        self.dispatch(&report.transitions, &threads, now, true).await;
        Ok(report)
    }

    /// Re-derives every thread against `now`, persisting and alerting on any
    /// thread that went stale purely because time passed.
    pub async fn refresh(&self) -> Result<Vec<Transition>, CoordinatorError> {
        self.refresh_at(Utc::now()).await
    }

    pub async fn refresh_at(&self, now: DateTime<Utc>) -> Result<Vec<Transition>, CoordinatorError> {
        let _guard = self.merge_lock.lock().await;
        let (settings, before) = self.load_state().await?;
        let mut threads = before.clone();
        rederive(&mut threads, &settings, now);
        let transitions = detect_transitions(&before, &threads);
        if self.commit(&before, &threads).await? {
            info!(event = "status_refreshed", transitions = transitions.len());
        }
        self.dispatch(&transitions, &threads, now, true).await;
        Ok(transitions)
    }

    pub async fn resolve(&self, thread_id: &str) -> Result<Option<Transition>, CoordinatorError> {
        self.resolve_at(thread_id, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, CoordinatorError> {
        self.apply_override(thread_id, now, |record| {
            record.status = ThreadStatus::Resolved;
        })
        .await
    }

    /// Explicit reactivation of a resolved thread. The status is re-derived
    /// right away, so a long-idle thread comes back as stalled.
    pub async fn reopen(&self, thread_id: &str) -> Result<Option<Transition>, CoordinatorError> {
        self.reopen_at(thread_id, Utc::now()).await
    }

    pub async fn reopen_at(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Transition>, CoordinatorError> {
        self.apply_override(thread_id, now, |record| {
            if record.status == ThreadStatus::Resolved {
                record.status = ThreadStatus::Active;
            }
        })
        .await
    }

    pub async fn update_settings(&self, patch: &SettingsPatch) -> Result<Settings, CoordinatorError> {
        let _guard = self.merge_lock.lock().await;
        let current = load_settings(self.store.as_ref()).await?;
        let next = current.apply(patch)?;
        if next != current {
            save_settings(self.store.as_ref(), &next).await?;
            info!(
                event = "settings_updated",
                notifications_enabled = next.notifications_enabled,
                stalled_threshold_days = next.stalled_threshold_days,
                scan_frequency = %next.scan_frequency
            );
        }
        Ok(next)
    }

    /// Read path for viewers. Statuses are derived against `now` without
    /// writing; on a store failure the last-known collection is served.
    pub async fn threads_view(&self) -> ThreadsView {
        self.threads_view_at(Utc::now()).await
    }

    pub async fn threads_view_at(&self, now: DateTime<Utc>) -> ThreadsView {
        match self.load_state().await {
            Ok((settings, mut threads)) => {
                rederive(&mut threads, &settings, now);
                ThreadsView {
                    threads: threads.into_values().collect(),
                    settings,
                    stale: false,
                }
            }
            Err(err) => {
                warn!(event = "threads_view_stale", error = %err);
                let mut threads = self.last_known.read().await.clone();
                let settings = Settings::default();
                for record in &mut threads {
                    record.status =
                        derive_status(record.status, record.last_activity, settings.threshold(), now);
                }
                ThreadsView {
                    threads,
                    settings,
                    stale: true,
                }
            }
        }
    }

    async fn apply_override<F>(
        &self,
        thread_id: &str,
        now: DateTime<Utc>,
        apply: F,
    ) -> Result<Option<Transition>, CoordinatorError>
    where
        F: FnOnce(&mut ThreadRecord),
    {
        let _guard = self.merge_lock.lock().await;
        let (settings, before) = self.load_state().await?;
        let mut threads = before.clone();
        let record = threads
            .get_mut(thread_id)
            .ok_or_else(|| CoordinatorError::UnknownThread(thread_id.to_string()))?;
        apply(record);
        rederive(&mut threads, &settings, now);
        let transitions = detect_transitions(&before, &threads);
        self.commit(&before, &threads).await?;
        // Explicit reactivation is the user's own action; only a drop
        // straight into stalled is worth an alert.
        self.dispatch(&transitions, &threads, now, false).await;
        Ok(transitions
            .into_iter()
            .find(|transition| transition.thread_id == thread_id))
    }

    async fn load_state(
        &self,
    ) -> Result<(Settings, BTreeMap<String, ThreadRecord>), CoordinatorError> {
        let settings = load_settings(self.store.as_ref()).await?;
        let records = load_threads(self.store.as_ref()).await?;
        *self.last_known.write().await = records.clone();
        let threads = records
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect();
        Ok((settings, threads))
    }

    async fn commit(
        &self,
        before: &BTreeMap<String, ThreadRecord>,
        after: &BTreeMap<String, ThreadRecord>,
    ) -> Result<bool, CoordinatorError> {
        if before == after {
            debug!(event = "merge_noop");
            return Ok(false);
        }
        let records = after.values().cloned().collect::<Vec<_>>();
        if let Err(err) = save_threads(self.store.as_ref(), &records).await {
            warn!(event = "merge_aborted", error = %err);
            return Err(err.into());
        }
        *self.last_known.write().await = records;
        Ok(true)
    }

    async fn dispatch(
        &self,
        transitions: &[Transition],
        threads: &BTreeMap<String, ThreadRecord>,
        now: DateTime<Utc>,
        alert_on_reopen: bool,
    ) {
        for transition in transitions {
            let Some(record) = threads.get(&transition.thread_id) else {
                continue;
            };
            info!(
                event = "thread_transition",
                thread_id = %transition.thread_id,
                from = %transition.from,
                to = %transition.to
            );
            match transition.kind {
                TransitionKind::Stalled => {
                    self.notifier
                        .notify(&record.id, &record.subject, record.days_since_activity(now))
                        .await;
                }
                TransitionKind::Reopened if alert_on_reopen => {
                    self.notifier
                        .notify_reopened(&record.id, &record.subject)
                        .await;
                }
                TransitionKind::Reopened => {}
                TransitionKind::Recovered | TransitionKind::Resolved => {
                    self.notifier.withdraw(&record.id).await;
                }
            }
        }
    }
}

/// Folds an incoming observation into the persisted record. The freshest
/// `lastActivity` wins regardless of arrival order; subject and participants
/// travel with it. Returns whether anything changed.
fn merge_into(existing: &mut ThreadRecord, incoming: ThreadRecord) -> bool {
    let before = existing.clone();
    let resolving = incoming.status == ThreadStatus::Resolved;
    if incoming.last_activity > existing.last_activity {
        existing.last_activity = incoming.last_activity;
        existing.subject = incoming.subject;
        existing.participants = incoming.participants;
        if existing.status == ThreadStatus::Resolved && !resolving {
            existing.status = ThreadStatus::Active;
        }
    }
    if resolving {
        existing.status = ThreadStatus::Resolved;
    }
    *existing != before
}

fn rederive(threads: &mut BTreeMap<String, ThreadRecord>, settings: &Settings, now: DateTime<Utc>) {
    let threshold = settings.threshold();
    for record in threads.values_mut() {
        record.status = derive_status(record.status, record.last_activity, threshold, now);
    }
}

fn detect_transitions(
    before: &BTreeMap<String, ThreadRecord>,
    after: &BTreeMap<String, ThreadRecord>,
) -> Vec<Transition> {
    after
        .values()
        .filter_map(|record| {
            let from = before
                .get(&record.id)
                .map(|previous| previous.status)
                .unwrap_or(ThreadStatus::Active);
            let kind = classify(from, record.status)?;
            Some(Transition {
                thread_id: record.id.clone(),
                kind,
                from,
                to: record.status,
            })
        })
        .collect()
}

fn classify(from: ThreadStatus, to: ThreadStatus) -> Option<TransitionKind> {
    match (from, to) {
        (a, b) if a == b => None,
        (_, ThreadStatus::Stalled) => Some(TransitionKind::Stalled),
        (_, ThreadStatus::Resolved) => Some(TransitionKind::Resolved),
        (ThreadStatus::Stalled, ThreadStatus::Active) => Some(TransitionKind::Recovered),
        (ThreadStatus::Resolved, ThreadStatus::Active) => Some(TransitionKind::Reopened),
        (ThreadStatus::Active, ThreadStatus::Active) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::MemoryAlertSurface;
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use tt_storage::{MemoryStore, SETTINGS_KEY, THREADS_KEY};

    struct Harness {
        store: Arc<MemoryStore>,
        surface: Arc<MemoryAlertSurface>,
        coordinator: Arc<Coordinator>,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let surface = Arc::new(MemoryAlertSurface::new());
        let notifier = Notifier::new(store.clone(), surface.clone());
        let coordinator = Arc::new(Coordinator::new(store.clone(), notifier));
        coordinator.initialize().await.expect("initialize");
        Harness {
            store,
            surface,
            coordinator,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn entry(id: &str, subject: &str, last_activity: DateTime<Utc>) -> Value {
        json!({
            "id": id,
            "subject": subject,
            "lastActivity": last_activity.to_rfc3339(),
            "participants": ["john.doe@example.com", "jane.smith@example.com"],
            "status": "active",
        })
    }

    async fn stored(h: &Harness) -> BTreeMap<String, ThreadRecord> {
        load_threads(h.store.as_ref())
            .await
            .expect("load threads")
            .into_iter()
            .map(|record| (record.id.clone(), record))
            .collect()
    }

    #[tokio::test]
    async fn stalled_and_active_threads_are_derived_on_merge() {
        let h = harness().await;
        let report = h
            .coordinator
            .receive_at(
                vec![
                    entry("1", "Project Status Update", now() - Duration::days(3)),
                    entry("2", "Budget Approval Request", now() - Duration::days(6)),
                ],
                "observer-a",
                now(),
            )
            .await
            .expect("merge");

        assert_eq!(report.inserted, 2);
        assert!(report.committed);
        let threads = stored(&h).await;
        assert_eq!(threads["1"].status, ThreadStatus::Active);
        assert_eq!(threads["2"].status, ThreadStatus::Stalled);
        assert_eq!(report.newly_stalled().count(), 1);

        let alert = h.surface.get("thread-2").await.expect("stalled alert");
        assert_eq!(
            alert.message,
            "Thread \"Budget Approval Request\" has been stalled for 6 days."
        );
    }

    #[tokio::test]
    async fn replaying_a_snapshot_is_idempotent() {
        let h = harness().await;
        let snapshot = vec![
            entry("1", "Project Status Update", now() - Duration::days(1)),
            entry("3", "Meeting Schedule", now() - Duration::days(7)),
        ];

        h.coordinator
            .receive_at(snapshot.clone(), "observer-a", now())
            .await
            .expect("first merge");
        let first_state = stored(&h).await;
        let writes = h.store.write_count();

        let replay = h
            .coordinator
            .receive_at(snapshot, "observer-a", now())
            .await
            .expect("replay");

        assert!(!replay.committed);
        assert!(replay.transitions.is_empty());
        assert_eq!(stored(&h).await, first_state);
        assert_eq!(h.store.write_count(), writes);
        assert_eq!(h.surface.delivery_count(), 1);
    }

    #[tokio::test]
    async fn freshest_activity_wins_over_arrival_order() {
        let h = harness().await;
        let t1 = now() - Duration::days(1);
        let t0 = now() - Duration::days(2);

        h.coordinator
            .receive_at(vec![entry("1", "newer subject", t1)], "observer-a", now())
            .await
            .expect("merge newer");
        let report = h
            .coordinator
            .receive_at(vec![entry("1", "older subject", t0)], "observer-b", now())
            .await
            .expect("merge older");

        assert_eq!(report.updated, 0);
        let threads = stored(&h).await;
        assert_eq!(threads["1"].last_activity, t1);
        assert_eq!(threads["1"].subject, "newer subject");
    }

    #[tokio::test]
    async fn newer_activity_carries_subject_and_participants() {
        let h = harness().await;
        h.coordinator
            .receive_at(vec![entry("1", "v1", now() - Duration::days(2))], "a", now())
            .await
            .expect("merge v1");
        h.coordinator
            .receive_at(
                vec![json!({
                    "id": "1",
                    "subject": "v2",
                    "lastActivity": (now() - Duration::hours(1)).to_rfc3339(),
                    "participants": ["new@example.com"],
                })],
                "b",
                now(),
            )
            .await
            .expect("merge v2");

        let threads = stored(&h).await;
        assert_eq!(threads["1"].subject, "v2");
        assert_eq!(
            threads["1"].participants.iter().collect::<Vec<_>>(),
            vec!["new@example.com"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_disjoint_snapshots_are_both_kept() {
        let h = harness().await;
        let mut handles = Vec::new();
        for (id, source) in [("1", "observer-a"), ("2", "observer-b"), ("3", "observer-c")] {
            let coordinator = h.coordinator.clone();
            let snapshot = vec![entry(id, "thread", now() - Duration::days(1))];
            handles.push(tokio::spawn(async move {
                coordinator.receive_at(snapshot, source, now()).await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("merge");
        }

        let threads = stored(&h).await;
        assert_eq!(threads.keys().collect::<Vec<_>>(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn disabled_notifications_still_persist_stalled_state() {
        let h = harness().await;
        h.store
            .set(SETTINGS_KEY, json!({"notificationsEnabled": false}))
            .await
            .expect("disable");

        h.coordinator
            .receive_at(vec![entry("2", "Budget", now() - Duration::days(6))], "a", now())
            .await
            .expect("merge");

        assert_eq!(stored(&h).await["2"].status, ThreadStatus::Stalled);
        assert_eq!(h.surface.delivery_count(), 0);
    }

    #[tokio::test]
    async fn store_write_failure_commits_nothing_and_alerts_nothing() {
        let h = harness().await;
        h.store.set_fail_writes(true);

        let result = h
            .coordinator
            .receive_at(vec![entry("2", "Budget", now() - Duration::days(6))], "a", now())
            .await;

        assert!(matches!(result, Err(CoordinatorError::StoreUnavailable(_))));
        h.store.set_fail_writes(false);
        assert!(stored(&h).await.is_empty());
        assert_eq!(h.surface.delivery_count(), 0);

        h.coordinator
            .receive_at(vec![entry("2", "Budget", now() - Duration::days(6))], "a", now())
            .await
            .expect("retry after recovery");
        assert_eq!(h.surface.delivery_count(), 1);
    }

    #[tokio::test]
    async fn malformed_entries_are_dropped_and_the_rest_merged() {
        let h = harness().await;
        let report = h
            .coordinator
            .receive_at(
                vec![
                    json!({"subject": "missing id", "lastActivity": now().to_rfc3339()}),
                    json!({"id": "x", "lastActivity": "yesterday-ish"}),
                    entry("5", "valid", now() - Duration::hours(3)),
                ],
                "a",
                now(),
            )
            .await
            .expect("merge");

        assert_eq!(report.received, 3);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(stored(&h).await.keys().collect::<Vec<_>>(), vec!["5"]);
    }

    #[tokio::test]
    async fn out_of_range_epoch_is_dropped_and_later_merges_succeed() {
        let h = harness().await;
        let report = h
            .coordinator
            .receive_at(
                vec![json!({"id": "big", "lastActivity": 253_402_300_800_000_i64})],
                "a",
                now(),
            )
            .await
            .expect("first merge");
        assert_eq!(report.dropped, 1);
        assert!(!report.committed);

        let report = h
            .coordinator
            .receive_at(vec![entry("1", "normal", now() - Duration::hours(2))], "a", now())
            .await
            .expect("second merge");
        assert_eq!(report.inserted, 1);
        assert_eq!(stored(&h).await.keys().collect::<Vec<_>>(), vec!["1"]);
    }

    #[tokio::test]
    async fn unreadable_stored_record_does_not_block_merges() {
        let h = harness().await;
        h.store
            .set(
                THREADS_KEY,
                json!([{"id": "big", "lastActivity": "+10000-01-01T00:00:00Z"}]),
            )
            .await
            .expect("seed");

        let report = h
            .coordinator
            .receive_at(vec![entry("1", "normal", now() - Duration::hours(2))], "a", now())
            .await
            .expect("merge");
        assert!(report.committed);
        assert_eq!(stored(&h).await.keys().collect::<Vec<_>>(), vec!["1"]);
        assert!(h.coordinator.resolve_at("1", now()).await.expect("resolve").is_some());
    }

    #[tokio::test]
    async fn leaving_and_reentering_stalled_alerts_again() {
        let h = harness().await;
        let old = now() - Duration::days(6);
        h.coordinator
            .receive_at(vec![entry("2", "Budget", old)], "a", now())
            .await
            .expect("stall");
        assert_eq!(h.surface.delivery_count(), 1);

        h.coordinator
            .receive_at(vec![entry("2", "Budget", now() - Duration::hours(1))], "a", now())
            .await
            .expect("recover");
        assert_eq!(stored(&h).await["2"].status, ThreadStatus::Active);
        assert!(h.surface.get("thread-2").await.is_none());

        let later = now() + Duration::days(6);
        let transitions = h.coordinator.refresh_at(later).await.expect("refresh");
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].kind, TransitionKind::Stalled);
        assert_eq!(h.surface.delivery_count(), 2);

        let again = h.coordinator.refresh_at(later).await.expect("refresh again");
        assert!(again.is_empty());
        assert_eq!(h.surface.delivery_count(), 2);
    }

    #[tokio::test]
    async fn resolved_is_sticky_until_newer_activity() {
        let h = harness().await;
        let t = now() - Duration::days(6);
        h.coordinator
            .receive_at(vec![entry("2", "Budget", t)], "a", now())
            .await
            .expect("stall");

        let resolved = h
            .coordinator
            .resolve_at("2", now())
            .await
            .expect("resolve")
            .expect("transition");
        assert_eq!(resolved.kind, TransitionKind::Resolved);
        assert!(h.surface.get("thread-2").await.is_none());

        let replay = h
            .coordinator
            .receive_at(vec![entry("2", "Budget", t)], "a", now())
            .await
            .expect("replay");
        assert!(replay.transitions.is_empty());
        assert_eq!(stored(&h).await["2"].status, ThreadStatus::Resolved);

        let reopened = h
            .coordinator
            .receive_at(vec![entry("2", "Budget", now() - Duration::hours(2))], "a", now())
            .await
            .expect("reopen");
        assert_eq!(reopened.transitions[0].kind, TransitionKind::Reopened);
        assert_eq!(stored(&h).await["2"].status, ThreadStatus::Active);
        let alert = h.surface.get("thread-2").await.expect("reopen alert");
        assert_eq!(alert.title, crate::notifier::REOPENED_TITLE);
    }

    #[tokio::test]
    async fn snapshot_reporting_resolution_resolves_the_thread() {
        let h = harness().await;
        h.coordinator
            .receive_at(vec![entry("7", "Offsite", now() - Duration::days(1))], "a", now())
            .await
            .expect("insert");
        let mut resolved_entry = entry("7", "Offsite", now() - Duration::days(2));
        resolved_entry["status"] = json!("resolved");

        let report = h
            .coordinator
            .receive_at(vec![resolved_entry], "a", now())
            .await
            .expect("resolve via snapshot");
        assert_eq!(report.transitions[0].kind, TransitionKind::Resolved);
        assert_eq!(stored(&h).await["7"].status, ThreadStatus::Resolved);
    }

    #[tokio::test]
    async fn explicit_reopen_rederives_without_reopen_alert() {
        let h = harness().await;
        h.coordinator
            .receive_at(vec![entry("8", "Vendor", now() - Duration::days(1))], "a", now())
            .await
            .expect("insert");
        h.coordinator.resolve_at("8", now()).await.expect("resolve");

        let transition = h
            .coordinator
            .reopen_at("8", now())
            .await
            .expect("reopen")
            .expect("transition");
        assert_eq!(transition.kind, TransitionKind::Reopened);
        assert_eq!(h.surface.delivery_count(), 0);

        h.coordinator.resolve_at("8", now()).await.expect("resolve");
        let stalled = h
            .coordinator
            .reopen_at("8", now() + Duration::days(10))
            .await
            .expect("reopen late")
            .expect("transition");
        assert_eq!(stalled.kind, TransitionKind::Stalled);
        assert_eq!(h.surface.delivery_count(), 1);
    }

    #[tokio::test]
    async fn unknown_thread_cannot_be_resolved() {
        let h = harness().await;
        let result = h.coordinator.resolve_at("missing", now()).await;
        assert!(matches!(result, Err(CoordinatorError::UnknownThread(_))));
    }

    #[tokio::test]
    async fn threads_view_derives_lazily_and_falls_back_to_cache() {
        let h = harness().await;
        h.coordinator
            .receive_at(vec![entry("1", "Status", now() - Duration::days(3))], "a", now())
            .await
            .expect("insert");

        let later = now() + Duration::days(3);
        let view = h.coordinator.threads_view_at(later).await;
        assert!(!view.stale);
        assert_eq!(view.threads[0].status, ThreadStatus::Stalled);
        assert_eq!(stored(&h).await["1"].status, ThreadStatus::Active);

        h.store.set_fail_reads(true);
        let view = h.coordinator.threads_view_at(now()).await;
        assert!(view.stale);
        assert_eq!(view.threads.len(), 1);
        assert_eq!(view.threads[0].id, "1");
    }

    #[tokio::test]
    async fn threshold_changes_take_effect_on_next_refresh() {
        let h = harness().await;
        h.coordinator
            .receive_at(vec![entry("1", "Status", now() - Duration::days(3))], "a", now())
            .await
            .expect("insert");
        assert_eq!(h.surface.delivery_count(), 0);

        let settings = h
            .coordinator
            .update_settings(&SettingsPatch {
                stalled_threshold_days: Some(2),
                ..SettingsPatch::default()
            })
            .await
            .expect("update settings");
        assert_eq!(settings.stalled_threshold_days, 2);

        let transitions = h.coordinator.refresh_at(now()).await.expect("refresh");
        assert_eq!(transitions.len(), 1);
        assert_eq!(h.surface.delivery_count(), 1);

        let invalid = h
            .coordinator
            .update_settings(&SettingsPatch {
                stalled_threshold_days: Some(0),
                ..SettingsPatch::default()
            })
            .await;
        assert!(matches!(invalid, Err(CoordinatorError::InvalidSettings(_))));
    }
}
