//! Rate-limited progress reporting for long document copies.

use std::time::{Duration, Instant};
use tracing::info;

const SECONDS_BETWEEN: Duration = Duration::from_secs(60);
const CHECK_INTERVAL: u64 = 128;

/// Emits a progress log line at most once per time interval, checked every
/// `check_interval` batches.
pub struct ProgressMeter {
    ns: String,
    documents_to_copy: u64,
    documents_seen: u64,
    batches: u64,
    seconds_between: Duration,
    check_interval: u64,
    last_report: Instant,
}

impl ProgressMeter {
    pub fn new(ns: impl Into<String>, documents_to_copy: u64) -> ProgressMeter {
        ProgressMeter::with_intervals(ns, documents_to_copy, SECONDS_BETWEEN, CHECK_INTERVAL)
    }

    pub fn with_intervals(
        ns: impl Into<String>,
        documents_to_copy: u64,
        seconds_between: Duration,
        check_interval: u64,
    ) -> ProgressMeter {
        ProgressMeter {
            ns: ns.into(),
            documents_to_copy,
            documents_seen: 0,
            batches: 0,
            seconds_between,
            check_interval: check_interval.max(1),
            last_report: Instant::now(),
        }
    }

    /// Record one received batch of `docs` documents. Returns whether a
    /// progress line was emitted.
    pub fn hit(&mut self, docs: u64) -> bool {
        self.documents_seen += docs;
        self.batches += 1;
        if self.batches % self.check_interval != 0 {
            return false;
        }
        if self.last_report.elapsed() < self.seconds_between {
            return false;
        }
        self.last_report = Instant::now();
        info!(
            ns = %self.ns,
            documents_copied = self.documents_seen,
            documents_to_copy = self.documents_to_copy,
            batches = self.batches,
            "Collection clone progress. "
        );
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reports_only_on_check_interval() {
        let mut meter = ProgressMeter::with_intervals("a.b", 100, Duration::ZERO, 4);
        assert!(!meter.hit(10));
        assert!(!meter.hit(10));
        assert!(!meter.hit(10));
        assert!(meter.hit(10));
        assert!(!meter.hit(10));
    }

    #[test]
    fn test_time_interval_suppresses_reports() {
        let mut meter = ProgressMeter::with_intervals("a.b", 100, Duration::from_secs(3600), 1);
        // First hit is within the interval of construction time.
        assert!(!meter.hit(1));
        assert!(!meter.hit(1));
    }
}
