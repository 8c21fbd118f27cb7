use crate::client::{SubmissionOutcome, SubmissionRequest};
use crate::dispatcher::RunReport;
use crate::error::{ConnectionError, CoreError};
use crate::stats::StatsSnapshot;
use crate::utils::egress_pool::{EgressPoint, ProbeResult};
use crate::utils::retry::{with_retry, RetryConfig};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{error, info};

/// Session with the remote service.
#[async_trait]
pub trait SubmissionClient: Send + Sync {
    /// Performs one handshake attempt.
    async fn connect(&self) -> Result<()>;

    /// Sends one request. Remote rejections come back as an outcome; only a
    /// lost session is an error.
    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionOutcome, CoreError>;

    /// Opens the session, retrying the handshake within `retry`'s budget.
    async fn open(&self, retry: &RetryConfig) -> Result<(), CoreError> {
        with_retry(retry, "session handshake", || self.connect())
            .await
            .map_err(|e| {
                ConnectionError::HandshakeFailed {
                    attempts: retry.attempts(),
                    reason: format!("{:#}", e),
                }
                .into()
            })
    }
}

/// Liveness and latency check for an egress point.
#[async_trait]
pub trait EgressProber: Send + Sync {
    async fn probe(&self, point: &EgressPoint) -> ProbeResult;
}

/// Events emitted to whoever renders progress.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Progress(StatsSnapshot),
    Finished(RunReport),
}

/// Consumer of the progress/result stream.
pub trait ProgressSink: Send + Sync {
    /// Called once per request that reaches a terminal classification.
    fn on_progress(&self, snapshot: &StatsSnapshot);

    /// Called exactly once when the run stops, aborted runs included.
    fn on_finished(&self, report: &RunReport);
}

impl ProgressSink for UnboundedSender<ProgressEvent> {
    fn on_progress(&self, snapshot: &StatsSnapshot) {
        // A dropped receiver only means nobody is watching.
        let _ = self.send(ProgressEvent::Progress(snapshot.clone()));
    }

    fn on_finished(&self, report: &RunReport) {
        let _ = self.send(ProgressEvent::Finished(report.clone()));
    }
}

/// Writes progress lines through `tracing` under the `progress` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ProgressSink for LogSink {
    fn on_progress(&self, s: &StatsSnapshot) {
        info!(
            target: "progress",
            "[{:03}/{:03}] {:5.1}% | Success: {} | Failed: {} | Proxies: {}",
            s.attempted,
            s.total,
            s.percent_complete,
            s.succeeded,
            s.failed,
            s.distinct_proxies_used
        );
    }

    fn on_finished(&self, report: &RunReport) {
        let s = &report.stats;
        info!(
            target: "progress",
            "Run {} in {:.1}s | Success: {} | Failed: {} | Cancelled: {} | Retries: {} | Proxies: {} | Success Rate: {:.2}%",
            report.outcome,
            s.elapsed_ms as f64 / 1000.0,
            s.succeeded,
            s.failed,
            s.cancelled,
            s.retries_processed,
            s.distinct_proxies_used,
            s.success_rate()
        );
    }
}

/// Writes one compact JSON object per line to stdout: a snapshot per
/// progress event, then the final report.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLinesSink;

impl ProgressSink for JsonLinesSink {
    fn on_progress(&self, snapshot: &StatsSnapshot) {
        println!("{}", snapshot.to_compact_json());
    }

    fn on_finished(&self, report: &RunReport) {
        match serde_json::to_string(report) {
            Ok(line) => println!("{}", line),
            Err(e) => error!("Failed to serialize run report: {}", e),
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn on_progress(&self, _snapshot: &StatsSnapshot) {}

    fn on_finished(&self, _report: &RunReport) {}
}
