use crate::fault::DEFAULT_RETRY_AFTER;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-connection "do not use before" deadlines driven by server throttle
/// signals. Deadlines only move forward; they expire by the clock, never by
/// an explicit rollback.
#[derive(Debug, Default)]
pub struct ThrottleTracker {
    entries: Mutex<HashMap<String, Instant>>,
}

impl ThrottleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_throttled(&self, connection: &str) -> bool {
        self.remaining(connection).is_some()
    }

    /// Time left inside the connection's `notBefore` window, if any.
    pub fn remaining(&self, connection: &str) -> Option<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = entries.get(connection)?;
        deadline.checked_duration_since(Instant::now())
    }

    /// Records a throttle signal. A missing retry-after falls back to 30
    /// seconds. The deadline is monotonic: an earlier signal never shortens
    /// a later one.
    pub fn record(&self, connection: &str, retry_after: Option<Duration>) {
        let deadline = Instant::now() + retry_after.unwrap_or(DEFAULT_RETRY_AFTER);
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .entry(connection.to_string())
            .and_modify(|current| {
                if deadline > *current {
                    *current = deadline;
                }
            })
            .or_insert(deadline);
    }

    pub fn clear(&self, connection: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(connection);
    }

    /// Snapshot of connections still inside their window.
    pub fn live_entries(&self) -> Vec<(String, Duration)> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter_map(|(name, deadline)| {
                deadline
                    .checked_duration_since(now)
                    .map(|left| (name.clone(), left))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_expiry() {
        let tracker = ThrottleTracker::new();
        assert!(!tracker.is_throttled("primary"));

        tracker.record("primary", Some(Duration::from_millis(40)));
        assert!(tracker.is_throttled("primary"));

        std::thread::sleep(Duration::from_millis(60));
        assert!(!tracker.is_throttled("primary"));
    }

    #[test]
    fn deadline_never_decreases() {
        let tracker = ThrottleTracker::new();
        tracker.record("primary", Some(Duration::from_secs(60)));
        let long = tracker.remaining("primary").unwrap();

        tracker.record("primary", Some(Duration::from_secs(1)));
        let after = tracker.remaining("primary").unwrap();
        assert!(after >= long - Duration::from_millis(50));
    }

    #[test]
    fn missing_retry_after_uses_fallback() {
        let tracker = ThrottleTracker::new();
        tracker.record("primary", None);
        let left = tracker.remaining("primary").unwrap();
        assert!(left > Duration::from_secs(25));
        assert!(left <= Duration::from_secs(30));
    }

    #[test]
    fn clear_removes_the_window() {
        let tracker = ThrottleTracker::new();
        tracker.record("primary", Some(Duration::from_secs(60)));
        tracker.clear("primary");
        assert!(!tracker.is_throttled("primary"));
        assert!(tracker.live_entries().is_empty());
    }
}
