use tokio::time::{Duration, Instant};

/// Trailing-edge debounce over context-change notifications. Time is passed
/// in explicitly so the policy is testable without a clock.
#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
    reason: Option<String>,
    collapsed: u32,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            reason: None,
            collapsed: 0,
        }
    }

    /// Records a change and pushes the deadline out by one window.
    pub fn trigger(&mut self, reason: impl Into<String>, now: Instant) {
        if self.deadline.is_some() {
            self.collapsed += 1;
        }
        self.deadline = Some(now + self.window);
        self.reason = Some(reason.into());
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// Fires once the quiet window has elapsed, returning the latest reason
    /// and how many earlier triggers were folded into it.
    pub fn poll(&mut self, now: Instant) -> Option<(String, u32)> {
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        self.deadline = None;
        let collapsed = std::mem::take(&mut self.collapsed);
        Some((self.reason.take().unwrap_or_default(), collapsed))
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
        self.reason = None;
        self.collapsed = 0;
    }
}
