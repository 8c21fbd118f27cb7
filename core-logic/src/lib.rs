//! # Fanout Core - Paced Batch Submission Engine
//!
//! Issues a batch of identical requests against a remote service, rotating
//! through a pool of identities (least-recently-used first) and a pool of
//! egress points (round-robin), pacing submissions and retrying transient
//! rejections from a deadline-ordered queue.
//!
//! ## Modules
//!
//! - [`config`] - Job parameters and dispatcher configuration
//! - [`client`] - Submission requests, outcome classification, simulated remote
//! - [`dispatcher`] - The run state machine
//! - [`error`] - Typed error handling with thiserror
//! - [`stats`] - Run statistics and snapshots
//! - [`traits`] - Seams for the remote, egress probing and progress output
//! - [`utils`] - Pools, retry plumbing, logging

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod stats;
pub mod traits;
pub mod utils;

pub use client::{
    is_retryable_code, OutcomeKind, SimulatedClient, SimulationProfile, SubmissionOutcome,
    SubmissionRequest, RETRYABLE_CODES,
};
pub use config::{DispatchConfig, EgressPolicy, JobRequest};
pub use dispatcher::{DispatchState, Dispatcher, RunOutcome, RunReport};
pub use error::{
    ConfigError, ConnectionError, CoreError, DispatchError, PoolError, PoolKind, RemoteError,
};
pub use stats::{StatsSnapshot, StatsTracker};
pub use traits::{
    EgressProber, JsonLinesSink, LogSink, NullSink, ProgressEvent, ProgressSink, SubmissionClient,
};

pub use utils::{
    setup_logger, EgressPoint, EgressPool, EgressScheme, Identity, IdentityPool, IdentityStatus,
    JobRunner, ProbeResult, RetryQueue, RetryQueueEntry, SelectedEgress, TcpProber,
};

// Export retry utilities for testing
pub use utils::retry::{with_retry, BackoffPolicy, RetryConfig};
