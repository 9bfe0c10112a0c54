use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tt_core::dedup_key;
use tt_storage::{load_settings, Store};

pub const STALLED_TITLE: &str = "Stalled Thread Reminder";
pub const REOPENED_TITLE: &str = "Thread Reopened";
pub const ALERT_PRIORITY: i32 = 2;

/// What the external alerting surface receives. `id` is the dedup key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertDescriptor {
    pub id: String,
    pub title: String,
    pub message: String,
    pub priority: i32,
}

impl AlertDescriptor {
    pub fn stalled(thread_id: &str, subject: &str, days_since_activity: i64) -> Self {
        Self {
            id: dedup_key(thread_id),
            title: STALLED_TITLE.to_string(),
            message: format!(
                "Thread \"{subject}\" has been stalled for {days_since_activity} days."
            ),
            priority: ALERT_PRIORITY,
        }
    }

    pub fn reopened(thread_id: &str, subject: &str) -> Self {
        Self {
            id: dedup_key(thread_id),
            title: REOPENED_TITLE.to_string(),
            message: format!("Thread \"{subject}\" has new activity and was reopened."),
            priority: ALERT_PRIORITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("alert surface unavailable: {0}")]
    Unavailable(String),
    #[error("alert command failed: {0}")]
    Command(String),
}

/// External alerting surface. `show` must upsert by `alert.id`.
#[async_trait]
pub trait AlertSurface: Send + Sync {
    async fn show(&self, alert: &AlertDescriptor) -> Result<(), DeliveryError>;

    async fn dismiss(&self, alert_id: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    Delivered,
    Suppressed,
    Failed,
}

/// Delivers thread alerts, honoring `notificationsEnabled` as read at call
/// time. Failures are logged and never retried; the next stall check
/// re-derives the same state.
pub struct Notifier {
    store: Arc<dyn Store>,
    surface: Arc<dyn AlertSurface>,
}

impl Notifier {
    pub fn new(store: Arc<dyn Store>, surface: Arc<dyn AlertSurface>) -> Self {
        Self { store, surface }
    }

    pub async fn notify(
        &self,
        thread_id: &str,
        subject: &str,
        days_since_activity: i64,
    ) -> NotifyOutcome {
        self.deliver(AlertDescriptor::stalled(thread_id, subject, days_since_activity))
            .await
    }

    pub async fn notify_reopened(&self, thread_id: &str, subject: &str) -> NotifyOutcome {
        self.deliver(AlertDescriptor::reopened(thread_id, subject))
            .await
    }

    /// Removes the visible alert for a thread that left the stalled state.
    pub async fn withdraw(&self, thread_id: &str) {
        let alert_id = dedup_key(thread_id);
        if let Err(err) = self.surface.dismiss(&alert_id).await {
            warn!(event = "notify_dismiss_failed", alert_id = %alert_id, error = %err);
        }
    }

    async fn deliver(&self, alert: AlertDescriptor) -> NotifyOutcome {
        let settings = match load_settings(self.store.as_ref()).await {
            Ok(settings) => settings,
            Err(err) => {
                warn!(event = "notify_settings_unavailable", alert_id = %alert.id, error = %err);
                return NotifyOutcome::Failed;
            }
        };
        if !settings.notifications_enabled {
            debug!(event = "notify_suppressed", alert_id = %alert.id);
            return NotifyOutcome::Suppressed;
        }
        match self.surface.show(&alert).await {
            Ok(()) => {
                info!(event = "notify_delivered", alert_id = %alert.id, title = %alert.title);
                NotifyOutcome::Delivered
            }
            Err(err) => {
                warn!(event = "notify_delivery_failed", alert_id = %alert.id, error = %err);
                NotifyOutcome::Failed
            }
        }
    }
}

/// Keeps the set of visible alerts in memory, one per dedup key.
#[derive(Debug, Default)]
pub struct MemoryAlertSurface {
    visible: Mutex<BTreeMap<String, AlertDescriptor>>,
    deliveries: AtomicU64,
}

impl MemoryAlertSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn visible(&self) -> Vec<AlertDescriptor> {
        self.visible.lock().await.values().cloned().collect()
    }

    pub async fn get(&self, alert_id: &str) -> Option<AlertDescriptor> {
        self.visible.lock().await.get(alert_id).cloned()
    }

    /// Total `show` calls accepted, including replacements.
    pub fn delivery_count(&self) -> u64 {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AlertSurface for MemoryAlertSurface {
    async fn show(&self, alert: &AlertDescriptor) -> Result<(), DeliveryError> {
        let replaced = self
            .visible
            .lock()
            .await
            .insert(alert.id.clone(), alert.clone())
            .is_some();
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        info!(
            event = "alert_shown",
            alert_id = %alert.id,
            replaced,
            message = %alert.message
        );
        Ok(())
    }

    async fn dismiss(&self, alert_id: &str) -> Result<(), DeliveryError> {
        if self.visible.lock().await.remove(alert_id).is_some() {
            debug!(event = "alert_dismissed", alert_id = alert_id);
        }
        Ok(())
    }
}

/// Desktop notifications through `notify-send`. The synchronous hint makes
/// compliant daemons replace an existing bubble with the same key.
#[derive(Debug, Clone)]
pub struct DesktopAlertSurface {
    program: String,
    app_name: String,
}

impl DesktopAlertSurface {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            app_name: "thread-tracker".to_string(),
        }
    }

    // Capped at normal: daemons never expire critical bubbles and a
    // withdrawn alert cannot be closed from here.
    fn urgency(priority: i32) -> &'static str {
        if priority >= 1 {
            "normal"
        } else {
            "low"
        }
    }
}

impl Default for DesktopAlertSurface {
    fn default() -> Self {
        Self::new("notify-send")
    }
}

#[async_trait]
impl AlertSurface for DesktopAlertSurface {
    async fn show(&self, alert: &AlertDescriptor) -> Result<(), DeliveryError> {
        let status = Command::new(&self.program)
            .arg(format!("--app-name={}", self.app_name))
            .arg(format!("--urgency={}", Self::urgency(alert.priority)))
            .arg(format!(
                "--hint=string:x-canonical-private-synchronous:{}",
                alert.id
            ))
            .arg(&alert.title)
            .arg(&alert.message)
            .status()
            .await
            .map_err(|err| DeliveryError::Unavailable(err.to_string()))?;
        if !status.success() {
            return Err(DeliveryError::Command(format!(
                "{} exited with {status}",
                self.program
            )));
        }
        Ok(())
    }

    // notify-send cannot close a bubble; stale ones expire on their own.
    async fn dismiss(&self, _alert_id: &str) -> Result<(), DeliveryError> {
        Ok(())
    }
}
