//! Submission requests, outcome classification, and the simulated remote.

use crate::error::{CoreError, RemoteError};
use crate::traits::SubmissionClient;
use crate::utils::egress_pool::EgressPoint;
use crate::utils::identity_pool::Identity;
use crate::utils::retry::BackoffPolicy;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::ops::RangeInclusive;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// One submission attempt. Built fresh for every try.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRequest {
    pub target: String,
    pub reason: String,
    pub identity: Identity,
    pub egress: EgressPoint,
    /// 1-based position of the request in the job; kept across retries
    pub attempt_seq: u64,
}

impl SubmissionRequest {
    /// Same logical request routed through new resources.
    pub fn reassign(&self, identity: Identity, egress: EgressPoint) -> Self {
        Self {
            target: self.target.clone(),
            reason: self.reason.clone(),
            identity,
            egress,
            attempt_seq: self.attempt_seq,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// Result of one call to [`SubmissionClient::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub kind: OutcomeKind,
    pub error_code: Option<u16>,
    pub retry_after: Option<Duration>,
    pub latency_ms: Option<f64>,
    pub correlation_id: Option<u64>,
}

/// Status codes the remote uses for transient conditions.
pub const RETRYABLE_CODES: [u16; 3] = [429, 500, 503];

pub fn is_retryable_code(code: u16) -> bool {
    RETRYABLE_CODES.contains(&code)
}

impl SubmissionOutcome {
    pub fn success(correlation_id: u64, latency_ms: f64) -> Self {
        Self {
            kind: OutcomeKind::Success,
            error_code: None,
            retry_after: None,
            latency_ms: Some(latency_ms),
            correlation_id: Some(correlation_id),
        }
    }

    pub fn retryable(code: u16, retry_after: Duration) -> Self {
        Self {
            kind: OutcomeKind::RetryableFailure,
            error_code: Some(code),
            retry_after: Some(retry_after),
            latency_ms: None,
            correlation_id: None,
        }
    }

    pub fn fatal(code: u16) -> Self {
        Self {
            kind: OutcomeKind::FatalFailure,
            error_code: Some(code),
            retry_after: None,
            latency_ms: None,
            correlation_id: None,
        }
    }

    /// Classifies a status code reported by the remote.
    ///
    /// 2xx is a success; 429/500/503 are retryable and take the remote's
    /// cooldown when present, else a random `backoff` sample; anything else
    /// is fatal.
    pub fn from_status(
        code: u16,
        retry_after_hint: Option<Duration>,
        latency_ms: Option<f64>,
        correlation_id: Option<u64>,
        backoff: &BackoffPolicy,
    ) -> Self {
        let mut outcome = match code {
            200..=299 => Self {
                kind: OutcomeKind::Success,
                error_code: None,
                retry_after: None,
                latency_ms: None,
                correlation_id,
            },
            c if is_retryable_code(c) => Self::retryable(c, backoff.resolve(retry_after_hint)),
            c => Self::fatal(c),
        };
        outcome.latency_ms = latency_ms;
        outcome
    }

    pub fn is_success(&self) -> bool {
        self.kind == OutcomeKind::Success
    }

    /// The remote error this outcome represents, if any.
    pub fn as_error(&self) -> Option<RemoteError> {
        match self.kind {
            OutcomeKind::Success => None,
            OutcomeKind::RetryableFailure => Some(RemoteError::Retryable {
                code: self.error_code.unwrap_or_default(),
                retry_after_ms: self
                    .retry_after
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or_default(),
            }),
            OutcomeKind::FatalFailure => Some(RemoteError::Fatal {
                code: self.error_code.unwrap_or_default(),
            }),
        }
    }
}

/// Knobs for [`SimulatedClient`].
#[derive(Debug, Clone)]
pub struct SimulationProfile {
    /// Probability that a submission is accepted
    pub success_ratio: f64,
    /// Codes drawn uniformly on failure
    pub failure_codes: Vec<u16>,
    /// Probability that a retryable failure carries a cooldown hint
    pub hint_ratio: f64,
    pub hint_secs: RangeInclusive<u64>,
    pub latency_ms: RangeInclusive<u64>,
    /// Probability that a handshake attempt fails
    pub handshake_failure_ratio: f64,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            success_ratio: 0.85,
            failure_codes: vec![429, 500, 503, 403],
            hint_ratio: 0.5,
            hint_secs: 5..=60,
            latency_ms: 100..=800,
            handshake_failure_ratio: 0.0,
        }
    }
}

impl SimulationProfile {
    /// No artificial latency; useful for dry runs and tests.
    pub fn instant() -> Self {
        Self {
            latency_ms: 0..=0,
            ..Self::default()
        }
    }
}

const HANDSHAKE_STEPS: [&str; 6] = [
    "Resolving hostname...",
    "Establishing TCP connection...",
    "Performing TLS handshake...",
    "Exchanging keys...",
    "Negotiating session...",
    "Connection established",
];

/// Stand-in for the remote service, driven by a seedable RNG.
#[derive(Debug)]
pub struct SimulatedClient {
    profile: SimulationProfile,
    backoff: BackoffPolicy,
    rng: Mutex<StdRng>,
}

impl SimulatedClient {
    pub fn new(profile: SimulationProfile, backoff: BackoffPolicy) -> Self {
        Self {
            profile,
            backoff,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(profile: SimulationProfile, backoff: BackoffPolicy, seed: u64) -> Self {
        Self {
            profile,
            backoff,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    fn sample_ms(rng: &mut StdRng, range: &RangeInclusive<u64>) -> u64 {
        if range.start() >= range.end() {
            *range.start()
        } else {
            rng.gen_range(range.clone())
        }
    }
}

#[async_trait]
impl SubmissionClient for SimulatedClient {
    async fn connect(&self) -> Result<()> {
        for step in HANDSHAKE_STEPS {
            let pause = self.with_rng(|rng| rng.gen_range(5..=20u64));
            tokio::time::sleep(Duration::from_millis(pause)).await;
            debug!("{}", step);
        }
        let failed = self.with_rng(|rng| rng.gen_bool(self.profile.handshake_failure_ratio.clamp(0.0, 1.0)));
        if failed {
            return Err(anyhow!("simulated handshake reset by peer"));
        }
        Ok(())
    }

    async fn submit(&self, request: &SubmissionRequest) -> Result<SubmissionOutcome, CoreError> {
        let (latency, code, hint, correlation_id) = self.with_rng(|rng| {
            let latency = Self::sample_ms(rng, &self.profile.latency_ms);
            let accepted = rng.gen_bool(self.profile.success_ratio.clamp(0.0, 1.0))
                || self.profile.failure_codes.is_empty();
            let code = if accepted {
                200
            } else {
                self.profile.failure_codes[rng.gen_range(0..self.profile.failure_codes.len())]
            };
            let hint = (!accepted && rng.gen_bool(self.profile.hint_ratio.clamp(0.0, 1.0)))
                .then(|| Duration::from_secs(Self::sample_ms(rng, &self.profile.hint_secs)));
            let correlation_id = rng.gen_range(1_000_000_000_000u64..=9_999_999_999_999);
            (latency, code, hint, correlation_id)
        });

        tokio::time::sleep(Duration::from_millis(latency)).await;
        debug!(
            "Simulated submission #{} via {} as {} -> {}",
            request.attempt_seq, request.egress, request.identity.handle, code
        );

        Ok(SubmissionOutcome::from_status(
            code,
            hint,
            Some(latency as f64),
            Some(correlation_id),
            &self.backoff,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::egress_pool::EgressScheme;

    fn request() -> SubmissionRequest {
        SubmissionRequest {
            target: "target".to_string(),
            reason: "reason".to_string(),
            identity: Identity::new(7, "h", chrono::Utc::now()),
            egress: EgressPoint::new(EgressScheme::Https, "10.0.0.9", 8443),
            attempt_seq: 1,
        }
    }

    #[test]
    fn test_classification() {
        let backoff = BackoffPolicy::fixed(Duration::from_secs(9));

        let ok = SubmissionOutcome::from_status(200, None, Some(12.0), Some(5), &backoff);
        assert!(ok.is_success());
        assert_eq!(ok.correlation_id, Some(5));
        assert!(ok.as_error().is_none());

        let limited = SubmissionOutcome::from_status(429, None, None, None, &backoff);
        assert_eq!(limited.kind, OutcomeKind::RetryableFailure);
        assert_eq!(limited.retry_after, Some(Duration::from_secs(9)));

        let hinted =
            SubmissionOutcome::from_status(503, Some(Duration::from_secs(30)), None, None, &backoff);
        assert_eq!(hinted.retry_after, Some(Duration::from_secs(30)));

        let denied = SubmissionOutcome::from_status(403, Some(Duration::from_secs(30)), None, None, &backoff);
        assert_eq!(denied.kind, OutcomeKind::FatalFailure);
        assert_eq!(denied.retry_after, None);
        assert_eq!(denied.as_error(), Some(RemoteError::Fatal { code: 403 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_client_always_succeeds_at_ratio_one() {
        let profile = SimulationProfile {
            success_ratio: 1.0,
            ..SimulationProfile::instant()
        };
        let client = SimulatedClient::with_seed(profile, BackoffPolicy::default(), 7);
        client.connect().await.unwrap();
        for _ in 0..20 {
            let outcome = client.submit(&request()).await.unwrap();
            assert!(outcome.is_success());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_failures_use_profile_codes() {
        let profile = SimulationProfile {
            success_ratio: 0.0,
            failure_codes: vec![503],
            hint_ratio: 0.0,
            ..SimulationProfile::instant()
        };
        let backoff = BackoffPolicy::fixed(Duration::from_secs(3));
        let client = SimulatedClient::with_seed(profile, backoff, 11);
        let outcome = client.submit(&request()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::RetryableFailure);
        assert_eq!(outcome.error_code, Some(503));
        assert_eq!(outcome.retry_after, Some(Duration::from_secs(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_failure_is_reported() {
        let profile = SimulationProfile {
            handshake_failure_ratio: 1.0,
            ..SimulationProfile::instant()
        };
        let client = SimulatedClient::with_seed(profile, BackoffPolicy::default(), 3);
        assert!(client.connect().await.is_err());
    }
}
