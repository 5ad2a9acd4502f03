use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub const DEFAULT_SAMPLE_WINDOW: Duration = Duration::from_secs(30);
pub const MAX_SAMPLES: usize = 1000;
const ETA_CAP: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Thread-safe processed/succeeded/failed counters with overall and
/// rolling-window rates.
pub struct ProgressTracker {
    total: u64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    started: Instant,
    window: Duration,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub remaining: u64,
    pub elapsed: Duration,
    /// Records per second since the start.
    pub overall_rate: f64,
    /// Records per second across the sample window.
    pub instant_rate: f64,
    /// `None` means unknown: nothing processed yet, so no rate to project.
    pub eta: Option<Duration>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self::with_window(total, DEFAULT_SAMPLE_WINDOW)
    }

    pub fn with_window(total: u64, window: Duration) -> Self {
        Self {
            total,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started: Instant::now(),
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record(&self, succeeded: u64, failed: u64) {
        self.succeeded.fetch_add(succeeded, Ordering::SeqCst);
        self.failed.fetch_add(failed, Ordering::SeqCst);

        let processed = self.processed();
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back((now, processed));

        // Prune outside the window but keep at least two points so the
        // instant rate always has a span to work with.
        while samples.len() > 2 {
            match samples.front() {
                Some(&(at, _)) if now.duration_since(at) > self.window => {
                    samples.pop_front();
                }
                _ => break,
            }
        }
        while samples.len() > MAX_SAMPLES {
            samples.pop_front();
        }
    }

    pub fn processed(&self) -> u64 {
        self.succeeded.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let processed = succeeded + failed;
        let remaining = self.total.saturating_sub(processed);
        let elapsed = self.started.elapsed();

        let overall_rate = if elapsed.as_secs_f64() > 0.0 {
            processed as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let instant_rate = {
            let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
            match (samples.front(), samples.back()) {
                (Some(&(first_at, first_count)), Some(&(last_at, last_count)))
                    if last_at.duration_since(first_at).as_secs_f64() >= 0.1 =>
                {
                    let span = last_at.duration_since(first_at).as_secs_f64();
                    (last_count.saturating_sub(first_count)) as f64 / span
                }
                _ => overall_rate,
            }
        };

        let eta = if overall_rate > f64::EPSILON {
            let secs = remaining as f64 / overall_rate;
            Some(Duration::from_secs_f64(secs).min(ETA_CAP))
        } else {
            None
        };

        ProgressSnapshot {
            processed,
            succeeded,
            failed,
            remaining,
            elapsed,
            overall_rate,
            instant_rate,
            eta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_and_never_decrease() {
        let tracker = ProgressTracker::new(100);
        tracker.record(10, 2);
        tracker.record(5, 0);

        let snap = tracker.snapshot();
        assert_eq!(snap.processed, 17);
        assert_eq!(snap.succeeded, 15);
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.remaining, 83);
        assert!(snap.overall_rate >= 0.0);
    }

    #[test]
    fn eta_is_unknown_when_nothing_processed() {
        let tracker = ProgressTracker::new(100);
        std::thread::sleep(Duration::from_millis(10));
        let snap = tracker.snapshot();
        assert_eq!(snap.processed, 0);
        assert!(snap.eta.is_none());
    }

    #[test]
    fn eta_is_capped_at_seven_days() {
        let tracker = ProgressTracker::new(u64::MAX);
        std::thread::sleep(Duration::from_millis(20));
        tracker.record(1, 0);
        let snap = tracker.snapshot();
        assert!(snap.eta.unwrap() <= ETA_CAP);
    }

    #[test]
    fn instant_rate_falls_back_to_overall_on_a_narrow_window() {
        let tracker = ProgressTracker::new(100);
        tracker.record(10, 0);
        let snap = tracker.snapshot();
        // Samples are microseconds apart, far under the 0.1 s floor.
        assert!((snap.instant_rate - snap.overall_rate).abs() < 1e-6);
    }

    #[test]
    fn sample_queue_stays_bounded() {
        let tracker = ProgressTracker::with_window(1_000_000, Duration::from_secs(3600));
        for _ in 0..(MAX_SAMPLES + 50) {
            tracker.record(1, 0);
        }
        let samples = tracker.samples.lock().unwrap();
        assert!(samples.len() <= MAX_SAMPLES);
    }
}
