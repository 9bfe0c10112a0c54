use chrono::{DateTime, Utc};
use serde::Serialize;
use tt_core::{derive_status, Settings, ThreadRecord, ThreadStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRow {
    pub id: String,
    pub subject: String,
    pub status: ThreadStatus,
    pub days_since_activity: i64,
    pub last_activity: DateTime<Utc>,
    pub participants: Vec<String>,
}

/// Statuses are derived against `now` on read; the stored copy is not
/// touched. Stalled threads sort first, then the longest idle.
pub fn thread_rows(
    threads: Vec<ThreadRecord>,
    settings: &Settings,
    now: DateTime<Utc>,
    filter: Option<ThreadStatus>,
) -> Vec<ThreadRow> {
    let threshold = settings.threshold();
    let mut rows = threads
        .into_iter()
        .map(|record| {
            let status = derive_status(record.status, record.last_activity, threshold, now);
            ThreadRow {
                days_since_activity: record.days_since_activity(now),
                id: record.id,
                subject: record.subject,
                status,
                last_activity: record.last_activity,
                participants: record.participants.into_iter().collect(),
            }
        })
        .filter(|row| filter.map_or(true, |status| row.status == status))
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        status_rank(a.status)
            .cmp(&status_rank(b.status))
            .then(a.last_activity.cmp(&b.last_activity))
            .then(a.id.cmp(&b.id))
    });
    rows
}

fn status_rank(status: ThreadStatus) -> u8 {
    match status {
        ThreadStatus::Stalled => 0,
        ThreadStatus::Active => 1,
        ThreadStatus::Resolved => 2,
    }
}

pub fn render_table(rows: &[ThreadRow]) -> String {
    if rows.is_empty() {
        return "No tracked threads.\n".to_string();
    }
    let id_width = rows.iter().map(|row| row.id.len()).max().unwrap_or(2).max(2);
    let mut out = format!("{:<id_width$}  {:<8}  {:>4}  SUBJECT\n", "ID", "STATUS", "DAYS");
    for row in rows {
        out.push_str(&format!(
            "{:<id_width$}  {:<8}  {:>4}  {}\n",
            row.id, row.status, row.days_since_activity, row.subject
        ));
    }
    out
}

pub fn render_settings(settings: &Settings) -> String {
    format!(
        "notifications: {}\nstalled threshold: {} day(s)\nscan frequency: {}\n",
        if settings.notifications_enabled { "on" } else { "off" },
        settings.stalled_threshold_days,
        settings.scan_frequency
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn threads() -> Vec<ThreadRecord> {
        vec![
            ThreadRecord::new("1", "Project Status Update", now() - Duration::days(1)),
            ThreadRecord::new("2", "Budget Approval Request", now() - Duration::days(6)),
            ThreadRecord::new("3", "Meeting Schedule", now() - Duration::days(9))
                .with_status(ThreadStatus::Resolved),
        ]
    }

    #[test]
    fn rows_derive_status_lazily_and_sort_stalled_first() {
        let rows = thread_rows(threads(), &Settings::default(), now(), None);
        assert_eq!(
            rows.iter().map(|r| (r.id.as_str(), r.status)).collect::<Vec<_>>(),
            vec![
                ("2", ThreadStatus::Stalled),
                ("1", ThreadStatus::Active),
                ("3", ThreadStatus::Resolved),
            ]
        );
        assert_eq!(rows[0].days_since_activity, 6);
    }

    #[test]
    fn status_filter_and_threshold_apply() {
        let settings = Settings {
            stalled_threshold_days: 1,
            ..Settings::default()
        };
        let rows = thread_rows(threads(), &settings, now(), Some(ThreadStatus::Stalled));
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn table_lists_every_row() {
        let rows = thread_rows(threads(), &Settings::default(), now(), None);
        let table = render_table(&rows);
        assert!(table.starts_with("ID"));
        assert!(table.contains("stalled"));
        assert!(table.contains("Budget Approval Request"));
        assert_eq!(table.lines().count(), 4);
        assert_eq!(render_table(&[]), "No tracked threads.\n");
    }
}
