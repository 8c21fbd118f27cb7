//! # Dispatcher
//!
//! Drives one job through the `Idle → Running → Draining → Done` state machine.
//!
//! - **Running**: issues the `count` primary requests one after another,
//!   serving retry entries that are already due before each new primary.
//! - **Draining**: works off the retry queue in deadline order, sleeping
//!   until the earliest entry is due.
//! - **Done**: terminal; a final [`RunReport`] goes to the progress sink.
//!
//! Consecutive submissions are always separated by at least the job's delay.
//! Every admitted request ends as exactly one success or one failure. When
//! the run stops early, requests that were never admitted are counted as
//! cancelled, so `succeeded + failed + cancelled == count` holds at `Done`.

use crate::client::{OutcomeKind, SubmissionOutcome, SubmissionRequest};
use crate::config::{DispatchConfig, EgressPolicy, JobRequest};
use crate::error::{CoreError, DispatchError, PoolError, PoolKind};
use crate::stats::{StatsSnapshot, StatsTracker};
use crate::traits::{EgressProber, ProgressSink, SubmissionClient};
use crate::utils::egress_pool::{EgressPool, SelectedEgress, TcpProber};
use crate::utils::identity_pool::IdentityPool;
use crate::utils::retry::{BackoffPolicy, RetryConfig};
use crate::utils::retry_queue::{RetryQueue, RetryQueueEntry};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Running,
    Draining,
    Done,
}

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_DONE: u8 = 3;

impl DispatchState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_IDLE => DispatchState::Idle,
            STATE_RUNNING => DispatchState::Running,
            STATE_DRAINING => DispatchState::Draining,
            _ => DispatchState::Done,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DispatchState::Idle => STATE_IDLE,
            DispatchState::Running => STATE_RUNNING,
            DispatchState::Draining => STATE_DRAINING,
            DispatchState::Done => STATE_DONE,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every request reached a terminal classification
    Completed,
    /// Stopped through the cancellation token
    Cancelled,
    /// Stopped by a pool or connection error
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Cancelled => write!(f, "cancelled"),
            RunOutcome::Aborted => write!(f, "aborted"),
        }
    }
}

/// Final summary of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub stats: StatsSnapshot,
    pub error: Option<String>,
}

/// Where the request being attempted comes from.
enum Origin {
    Fresh(u64),
    Retry(RetryQueueEntry),
}

impl Origin {
    fn seq(&self) -> u64 {
        match self {
            Origin::Fresh(seq) => *seq,
            Origin::Retry(entry) => entry.request.attempt_seq,
        }
    }

    fn last_error_code(&self) -> Option<u16> {
        match self {
            Origin::Fresh(_) => None,
            Origin::Retry(entry) => entry.last_error_code,
        }
    }
}

/// Per-run state owned by the running future.
struct Run<'a> {
    job: &'a JobRequest,
    stats: StatsTracker,
    sink: &'a dyn ProgressSink,
    admitted: u64,
    last_submit: Option<Instant>,
}

impl Run<'_> {
    fn emit(&self) {
        self.sink.on_progress(&self.stats.snapshot());
    }
}

/// Orchestrates submissions for a single job.
pub struct Dispatcher {
    identities: Arc<IdentityPool>,
    egress: Arc<EgressPool>,
    client: Arc<dyn SubmissionClient>,
    prober: Arc<dyn EgressProber>,
    config: DispatchConfig,
    backoff: BackoffPolicy,
    retry_queue: RetryQueue,
    probed: Mutex<HashSet<usize>>,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        identities: Arc<IdentityPool>,
        egress: Arc<EgressPool>,
        client: Arc<dyn SubmissionClient>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            identities,
            egress,
            client,
            prober: Arc::new(TcpProber::new(config.probe_timeout())),
            backoff: BackoffPolicy::from_millis(config.backoff_min_ms, config.backoff_max_ms),
            config,
            retry_queue: RetryQueue::new(),
            probed: Mutex::new(HashSet::new()),
            state: AtomicU8::new(STATE_IDLE),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_prober(mut self, prober: Arc<dyn EgressProber>) -> Self {
        self.prober = prober;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that stops admission of new requests when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn pending_retries(&self) -> usize {
        self.retry_queue.len()
    }

    fn set_state(&self, state: DispatchState) {
        let previous = self.state.swap(state.as_u8(), Ordering::SeqCst);
        debug!(
            "Dispatcher {:?} -> {:?}",
            DispatchState::from_u8(previous),
            state
        );
    }

    /// Runs `job` to completion. A dispatcher runs exactly one job.
    ///
    /// Pool and connection errors abort the run and come back as a
    /// [`DispatchError`] carrying the partial stats; remote rejections are
    /// folded into the stats and never surface here.
    pub async fn run(
        &self,
        job: &JobRequest,
        sink: &dyn ProgressSink,
    ) -> Result<RunReport, DispatchError> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DispatchError {
                cause: CoreError::AlreadyStarted,
                partial: StatsSnapshot::default(),
            });
        }

        info!(
            "Starting job: {} requests against '{}' (delay {:.1}s, {} identities, {} egress points)",
            job.count,
            job.target,
            job.delay,
            self.identities.len(),
            self.egress.len()
        );

        let mut run = Run {
            job,
            stats: StatsTracker::new(u64::from(job.count)),
            sink,
            admitted: 0,
            last_submit: None,
        };

        let result = self.execute(&mut run).await;

        self.flush_retries(&run);
        let never_admitted = u64::from(job.count).saturating_sub(run.admitted);
        if never_admitted > 0 {
            run.stats.record_cancelled(never_admitted);
        }
        self.set_state(DispatchState::Done);

        let outcome = match &result {
            Ok(()) if self.cancel.is_cancelled() => RunOutcome::Cancelled,
            Ok(()) => RunOutcome::Completed,
            Err(_) => RunOutcome::Aborted,
        };
        let report = RunReport {
            outcome,
            stats: run.stats.snapshot(),
            error: result.as_ref().err().map(|e| e.to_string()),
        };
        sink.on_finished(&report);

        match result {
            Ok(()) => Ok(report),
            Err(cause) => {
                error!("Run aborted: {}", cause);
                Err(DispatchError {
                    cause,
                    partial: report.stats,
                })
            }
        }
    }

    async fn execute(&self, run: &mut Run<'_>) -> Result<(), CoreError> {
        run.job.validate()?;
        if self.identities.is_empty() {
            return Err(PoolError::Empty {
                pool: PoolKind::Identity,
            }
            .into());
        }
        if self.egress.is_empty() {
            return Err(PoolError::Empty {
                pool: PoolKind::Egress,
            }
            .into());
        }

        let retry = RetryConfig::for_attempts(
            self.config.session_open_attempts,
            self.config.session_retry_base_ms,
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                info!("Cancellation requested during session handshake");
                return Ok(());
            }
            opened = self.client.open(&retry) => opened?,
        }
        info!("Session established");

        'primary: for seq in 1..=u64::from(run.job.count) {
            while let Some(entry) = self.retry_queue.pop_due(Instant::now()) {
                if !self.pace(run).await {
                    self.fail_entry(run, entry);
                    break 'primary;
                }
                self.attempt(run, Origin::Retry(entry)).await?;
            }

            if !self.pace(run).await {
                break;
            }
            run.admitted += 1;
            self.attempt(run, Origin::Fresh(seq)).await?;
        }

        if self.cancel.is_cancelled() {
            info!("Cancellation requested; admission stopped");
            return Ok(());
        }

        self.set_state(DispatchState::Draining);
        if !self.retry_queue.is_empty() {
            info!("Draining {} queued retries", self.retry_queue.len());
        }

        while let Some(deadline) = self.retry_queue.next_deadline() {
            if !self.wait_until(deadline).await {
                break;
            }
            let Some(entry) = self.retry_queue.pop_due(Instant::now()) else {
                continue;
            };
            if !self.pace(run).await {
                self.fail_entry(run, entry);
                break;
            }
            self.attempt(run, Origin::Retry(entry)).await?;
        }

        Ok(())
    }

    /// Sleeps until `deadline`. Returns false if cancelled first.
    async fn wait_until(&self, deadline: Instant) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(deadline) => true,
        }
    }

    /// Enforces the inter-attempt delay. Returns false if cancelled.
    async fn pace(&self, run: &Run<'_>) -> bool {
        match run.last_submit {
            Some(last) => self.wait_until(last + run.job.delay_duration()).await,
            None => !self.cancel.is_cancelled(),
        }
    }

    async fn attempt(&self, run: &mut Run<'_>, origin: Origin) -> Result<(), CoreError> {
        let seq = origin.seq();
        if matches!(origin, Origin::Retry(_)) {
            run.stats.record_retry_processed();
        }

        let (request, outcome) = match self.submit_once(run, &origin).await {
            Ok(submitted) => submitted,
            Err(e) => {
                error!("Submission #{} FAILED: {}", seq, e);
                run.stats.record_failure(origin.last_error_code());
                run.emit();
                return Err(e);
            }
        };

        match outcome.kind {
            OutcomeKind::Success => {
                run.stats.record_success(&request.egress.id(), outcome.latency_ms);
                info!(
                    target: "attempt",
                    "#{:03} SUCCESS via {} as {} ({:.0}ms, ref {})",
                    seq,
                    request.egress,
                    request.identity.handle,
                    outcome.latency_ms.unwrap_or_default(),
                    outcome.correlation_id.unwrap_or_default()
                );
                run.emit();
            }
            OutcomeKind::RetryableFailure => {
                let remaining = match &origin {
                    Origin::Fresh(_) => self.config.max_retries,
                    Origin::Retry(entry) => entry.retries_remaining,
                };
                if remaining > 0 {
                    self.schedule_retry(run, origin, request, &outcome, remaining);
                } else {
                    warn!(
                        target: "attempt",
                        "#{:03} FAILED with {} after exhausting retries",
                        seq,
                        describe(&outcome)
                    );
                    run.stats.record_failure(outcome.error_code);
                    run.emit();
                }
            }
            OutcomeKind::FatalFailure => {
                warn!(
                    target: "attempt",
                    "#{:03} FAILED with {} via {}",
                    seq,
                    describe(&outcome),
                    request.egress
                );
                run.stats.record_failure(outcome.error_code);
                run.emit();
            }
        }
        Ok(())
    }

    async fn submit_once(
        &self,
        run: &mut Run<'_>,
        origin: &Origin,
    ) -> Result<(SubmissionRequest, SubmissionOutcome), CoreError> {
        let identity = self.identities.next().await?;
        let egress = self.select_egress().await?;

        let request = match origin {
            Origin::Fresh(seq) => SubmissionRequest {
                target: run.job.target.clone(),
                reason: run.job.reason.clone(),
                identity,
                egress: egress.point,
                attempt_seq: *seq,
            },
            Origin::Retry(entry) => entry.request.reassign(identity, egress.point),
        };

        run.last_submit = Some(Instant::now());
        let outcome = self.client.submit(&request).await?;
        run.stats.record_submission();
        Ok((request, outcome))
    }

    /// Queues the logical request again. `submitted` is what just went out;
    /// the queue keeps the first-built request so every retry is reassigned
    /// from it.
    fn schedule_retry(
        &self,
        run: &Run<'_>,
        origin: Origin,
        submitted: SubmissionRequest,
        outcome: &SubmissionOutcome,
        remaining: u32,
    ) {
        let retry_after = outcome
            .retry_after
            .unwrap_or_else(|| self.backoff.sample())
            .min(self.config.max_retry_after());
        let request = match origin {
            Origin::Fresh(_) => submitted,
            Origin::Retry(entry) => entry.request,
        };

        let Some(retry_not_before) = Instant::now().checked_add(retry_after) else {
            warn!(
                target: "attempt",
                "#{:03} FAILED with {}; cooldown of {:?} cannot be scheduled",
                request.attempt_seq,
                describe(outcome),
                retry_after
            );
            run.stats.record_failure(outcome.error_code);
            run.emit();
            return;
        };

        warn!(
            target: "attempt",
            "#{:03} RETRY with {}; next try in {:.1}s ({} left)",
            request.attempt_seq,
            describe(outcome),
            retry_after.as_secs_f64(),
            remaining - 1
        );
        self.retry_queue.push(RetryQueueEntry {
            request,
            retry_not_before,
            retries_remaining: remaining - 1,
            last_error_code: outcome.error_code,
        });
        run.stats.record_retry_scheduled();
    }

    /// Picks the next egress point, probing it on first use. Under
    /// [`EgressPolicy::SkipUnverified`] dead points are skipped for at most one
    /// full rotation before falling back to the last one seen.
    async fn select_egress(&self) -> Result<SelectedEgress, CoreError> {
        let rounds = match self.config.egress_policy {
            EgressPolicy::UseAll => 1,
            EgressPolicy::SkipUnverified => self.egress.len().max(1),
        };

        let mut last = None;
        for _ in 0..rounds {
            let mut selected = self.egress.next()?;
            if self.config.probe_on_first_use && self.first_use(selected.slot) {
                let result = self.egress.probe(selected.slot, self.prober.as_ref()).await?;
                selected.point.verified = result.alive;
                selected.point.last_latency_ms = result.latency_ms;
                if !result.alive {
                    warn!("Egress {} failed liveness probe", selected.point);
                }
            }

            if self.config.egress_policy == EgressPolicy::UseAll || selected.point.verified {
                return Ok(selected);
            }
            last = Some(selected);
        }

        let fallback = last.ok_or(PoolError::Empty {
            pool: PoolKind::Egress,
        })?;
        warn!(
            "No verified egress point available; routing through {}",
            fallback.point
        );
        Ok(fallback)
    }

    fn first_use(&self, slot: usize) -> bool {
        self.probed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(slot)
    }

    fn fail_entry(&self, run: &Run<'_>, entry: RetryQueueEntry) {
        warn!(
            target: "attempt",
            "#{:03} FAILED: retry abandoned, run stopping (last error {:?})",
            entry.request.attempt_seq,
            entry.last_error_code
        );
        run.stats.record_failure(entry.last_error_code);
        run.emit();
    }

    /// Folds every queued retry into `failed`.
    fn flush_retries(&self, run: &Run<'_>) {
        for entry in self.retry_queue.drain_all() {
            self.fail_entry(run, entry);
        }
    }
}

fn describe(outcome: &SubmissionOutcome) -> String {
    match outcome.as_error() {
        Some(e) => e.to_string(),
        None => "success".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::NullSink;
    use crate::utils::egress_pool::{EgressPoint, EgressScheme, ProbeResult};
    use crate::utils::identity_pool::Identity;
    use async_trait::async_trait;
    use std::time::Duration;

    struct AlwaysOk;

    #[async_trait]
    impl SubmissionClient for AlwaysOk {
        async fn connect(&self) -> anyhow::Result<()> {
            Ok(())
        }

        async fn submit(
            &self,
            request: &SubmissionRequest,
        ) -> Result<SubmissionOutcome, CoreError> {
            Ok(SubmissionOutcome::success(request.attempt_seq, 1.0))
        }
    }

    struct Alive;

    #[async_trait]
    impl EgressProber for Alive {
        async fn probe(&self, _point: &EgressPoint) -> ProbeResult {
            ProbeResult::alive(1.0)
        }
    }

    fn dispatcher() -> Dispatcher {
        let identities = (1..=3)
            .map(|i| Identity::new(i, format!("id-{}", i), chrono::Utc::now()))
            .collect();
        let points = (1..=2)
            .map(|i| EgressPoint::new(EgressScheme::Socks5, format!("10.0.0.{}", i), 1080))
            .collect();
        Dispatcher::new(
            Arc::new(IdentityPool::from_identities(identities).unwrap()),
            Arc::new(EgressPool::from_points(points)),
            Arc::new(AlwaysOk),
            DispatchConfig::default(),
        )
        .with_prober(Arc::new(Alive))
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_reaches_done() {
        let d = dispatcher();
        assert_eq!(d.state(), DispatchState::Idle);
        let report = d
            .run(&JobRequest::new("t", "r", 3, 0.1), &NullSink)
            .await
            .unwrap();
        assert_eq!(d.state(), DispatchState::Done);
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stats.succeeded, 3);
        assert!(report.stats.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_run_is_rejected() {
        let d = dispatcher();
        let job = JobRequest::new("t", "r", 1, 0.1);
        d.run(&job, &NullSink).await.unwrap();
        let err = d.run(&job, &NullSink).await.unwrap_err();
        assert!(matches!(err.cause, CoreError::AlreadyStarted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_job_is_rejected_before_submitting() {
        let d = dispatcher();
        let err = d
            .run(&JobRequest::new("t", "r", 0, 0.1), &NullSink)
            .await
            .unwrap_err();
        assert!(matches!(err.cause, CoreError::Config(_)));
        assert_eq!(err.partial.submissions, 0);
        assert_eq!(d.state(), DispatchState::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_admits_nothing() {
        let d = dispatcher();
        d.cancellation_token().cancel();
        let report = d
            .run(&JobRequest::new("t", "r", 4, 0.1), &NullSink)
            .await
            .unwrap();
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.stats.cancelled, 4);
        assert!(report.stats.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_are_paced() {
        let d = dispatcher();
        let start = Instant::now();
        d.run(&JobRequest::new("t", "r", 4, 1.5), &NullSink)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(4500));
    }
}
