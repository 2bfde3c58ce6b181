//! Periodic progress logging.

use std::time::{Duration, Instant};

use tracing::info;

/// Logs events processed, rate and remaining time at most once per
/// interval. Checking is a clock read, so it can run after every event.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    total: Option<u64>,
    interval: Duration,
    start: Instant,
    last_report: Instant,
}

impl ProgressReporter {
    /// Reporter for a run of `total` events (if known).
    pub fn new(total: Option<u64>, interval: Duration) -> Self {
        let now = Instant::now();
        Self {
            total,
            interval,
            start: now,
            last_report: now,
        }
    }

    /// Events per second so far.
    pub fn rate(&self, done: u64) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            done as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Estimated time to completion; `None` without a known total or rate.
    pub fn eta(&self, done: u64) -> Option<Duration> {
        let remaining = self.total?.saturating_sub(done);
        if remaining == 0 {
            return Some(Duration::ZERO);
        }
        let rate = self.rate(done);
        if rate > 0.0 {
            Duration::try_from_secs_f64(remaining as f64 / rate).ok()
        } else {
            None
        }
    }

    /// Log if the interval has passed. Returns whether a line was logged.
    pub fn update(&mut self, done: u64) -> bool {
        if self.last_report.elapsed() < self.interval {
            return false;
        }
        self.last_report = Instant::now();
        let rate = self.rate(done);
        match (self.total, self.eta(done)) {
            (Some(total), Some(eta)) => info!(
                events = done,
                total,
                rate = %format!("{rate:.1}/s"),
                eta_s = eta.as_secs(),
                "Processing"
            ),
            _ => info!(events = done, rate = %format!("{rate:.1}/s"), "Processing"),
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_zero_interval_reports_every_time() {
        let mut progress = ProgressReporter::new(Some(10), Duration::ZERO);
        assert!(progress.update(1));
        assert!(progress.update(2));
        assert!(logs_contain("Processing"));
    }

    #[test]
    fn test_long_interval_stays_quiet() {
        let mut progress = ProgressReporter::new(None, Duration::from_secs(3600));
        assert!(!progress.update(5));
        assert_eq!(progress.eta(5), None);
    }

    #[test]
    fn test_eta_at_completion() {
        let progress = ProgressReporter::new(Some(4), Duration::ZERO);
        assert_eq!(progress.eta(4), Some(Duration::ZERO));
        assert_eq!(progress.eta(9), Some(Duration::ZERO));
    }
}
