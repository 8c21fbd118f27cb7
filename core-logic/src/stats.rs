//! Run statistics shared between the dispatcher and progress consumers.

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Instant;

/// Consistent point-in-time copy of a run's counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub timestamp: String,
    /// Requests that reached a terminal classification
    pub attempted: u64,
    /// Requests the job asked for
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Requests never admitted because the run stopped early
    pub cancelled: u64,
    pub distinct_proxies_used: usize,
    pub proxies_used: Vec<String>,
    pub error_histogram: BTreeMap<u16, u64>,
    /// Calls made to the submission client, retries included
    pub submissions: u64,
    pub retries_scheduled: u64,
    pub retries_processed: u64,
    pub avg_latency_ms: f64,
    pub percent_complete: f64,
    pub elapsed_ms: u64,
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.attempted > 0 {
            self.succeeded as f64 / self.attempted as f64 * 100.0
        } else {
            0.0
        }
    }

    /// Every requested item is accounted for.
    pub fn is_settled(&self) -> bool {
        self.succeeded + self.failed + self.cancelled == self.total
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Single-line form, one object per progress event.
    pub fn to_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: u64,
    failed: u64,
    cancelled: u64,
    submissions: u64,
    retries_scheduled: u64,
    retries_processed: u64,
    latency_sum_ms: f64,
    latency_samples: u64,
    proxies_used: BTreeSet<String>,
    error_histogram: BTreeMap<u16, u64>,
}

/// Monotonic counters for one run. Every update and every snapshot goes through
/// a single lock, so snapshots never observe a half-applied update.
#[derive(Debug)]
pub struct StatsTracker {
    total: u64,
    counters: Mutex<Counters>,
    start_time: Instant,
}

impl StatsTracker {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            counters: Mutex::new(Counters::default()),
            start_time: Instant::now(),
        }
    }

    fn update<F: FnOnce(&mut Counters)>(&self, f: F) {
        // A poisoned lock still holds valid counters.
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut counters);
    }

    pub fn record_submission(&self) {
        self.update(|c| c.submissions += 1);
    }

    pub fn record_success(&self, egress_id: &str, latency_ms: Option<f64>) {
        self.update(|c| {
            c.succeeded += 1;
            c.proxies_used.insert(egress_id.to_string());
            if let Some(ms) = latency_ms {
                c.latency_sum_ms += ms;
                c.latency_samples += 1;
            }
        });
    }

    pub fn record_failure(&self, error_code: Option<u16>) {
        self.update(|c| {
            c.failed += 1;
            if let Some(code) = error_code {
                *c.error_histogram.entry(code).or_insert(0) += 1;
            }
        });
    }

    pub fn record_retry_scheduled(&self) {
        self.update(|c| c.retries_scheduled += 1);
    }

    pub fn record_retry_processed(&self) {
        self.update(|c| c.retries_processed += 1);
    }

    pub fn record_cancelled(&self, count: u64) {
        self.update(|c| c.cancelled += count);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let attempted = counters.succeeded + counters.failed;

        StatsSnapshot {
            timestamp: Utc::now().to_rfc3339(),
            attempted,
            total: self.total,
            succeeded: counters.succeeded,
            failed: counters.failed,
            cancelled: counters.cancelled,
            distinct_proxies_used: counters.proxies_used.len(),
            proxies_used: counters.proxies_used.iter().cloned().collect(),
            error_histogram: counters.error_histogram.clone(),
            submissions: counters.submissions,
            retries_scheduled: counters.retries_scheduled,
            retries_processed: counters.retries_processed,
            avg_latency_ms: if counters.latency_samples > 0 {
                counters.latency_sum_ms / counters.latency_samples as f64
            } else {
                0.0
            },
            percent_complete: if self.total > 0 {
                attempted as f64 / self.total as f64 * 100.0
            } else {
                0.0
            },
            elapsed_ms: self.start_time.elapsed().as_millis() as u64,
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_tracker_counts() {
        let stats = StatsTracker::new(4);

        stats.record_success("http://10.0.0.1:8080", Some(100.0));
        stats.record_success("http://10.0.0.1:8080", Some(200.0));
        stats.record_success("socks5://10.0.0.2:9050", None);
        stats.record_failure(Some(403));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempted, 4);
        assert_eq!(snapshot.succeeded, 3);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.distinct_proxies_used, 2);
        assert_eq!(snapshot.error_histogram.get(&403), Some(&1));
        assert!((snapshot.avg_latency_ms - 150.0).abs() < f64::EPSILON);
        assert!((snapshot.percent_complete - 100.0).abs() < f64::EPSILON);
        assert!(snapshot.is_settled());
    }

    #[test]
    fn test_failure_without_code_skips_histogram() {
        let stats = StatsTracker::new(1);
        stats.record_failure(None);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.failed, 1);
        assert!(snapshot.error_histogram.is_empty());
    }

    #[test]
    fn test_cancelled_counts_toward_settlement() {
        let stats = StatsTracker::new(3);
        stats.record_success("http://10.0.0.1:8080", None);
        stats.record_cancelled(2);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.attempted, 1);
        assert!(snapshot.is_settled());
    }

    #[test]
    fn test_json_export() {
        let stats = StatsTracker::new(1);
        stats.record_failure(Some(429));

        let snapshot = stats.snapshot();
        let json = snapshot.to_json();
        assert!(json.contains("error_histogram"));
        assert!(json.contains("\"429\""));

        let line = snapshot.to_compact_json();
        assert!(!line.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed["failed"], 1);
        assert_eq!(parsed["error_histogram"]["429"], 1);
    }
}
