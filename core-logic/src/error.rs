//! # Core Error Types
//!
//! Centralized error definitions for the fanout engine.
//! All errors implement `std::error::Error` and `std::fmt::Display`.
//!
//! Pool and connection errors abort a run. Remote errors never escape the
//! dispatcher; they only describe a [`SubmissionOutcome`](crate::SubmissionOutcome)
//! in logs.

use std::fmt;
use thiserror::Error;

use crate::stats::StatsSnapshot;

/// Unified error type for fanout-core operations.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Config(ConfigError),

    #[error(transparent)]
    Pool(PoolError),

    #[error(transparent)]
    Connection(ConnectionError),

    #[error(transparent)]
    Remote(RemoteError),

    #[error("Dispatcher has already been started; a dispatcher runs exactly one job")]
    AlreadyStarted,
}

impl CoreError {
    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CoreError::Remote(_))
    }
}

impl From<ConfigError> for CoreError {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl From<PoolError> for CoreError {
    fn from(e: PoolError) -> Self {
        CoreError::Pool(e)
    }
}

impl From<ConnectionError> for CoreError {
    fn from(e: ConnectionError) -> Self {
        CoreError::Connection(e)
    }
}

impl From<RemoteError> for CoreError {
    fn from(e: RemoteError) -> Self {
        CoreError::Remote(e)
    }
}

/// Configuration and job validation errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("Missing required configuration field: '{field}'")]
    MissingField { field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Invalid egress descriptor '{line}': {reason}")]
    InvalidEgress { line: String, reason: String },

    #[error("Parse error in {path}: {msg}")]
    Parse { path: String, msg: String },

    #[error("File not found: {path}")]
    FileNotFound { path: String },

    #[error("I/O error reading {path}: {msg}")]
    IoError { path: String, msg: String },
}

/// Which resource pool an error refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Identity,
    Egress,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::Identity => write!(f, "identity"),
            PoolKind::Egress => write!(f, "egress"),
        }
    }
}

/// Resource pool errors
#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("The {pool} pool is empty")]
    Empty { pool: PoolKind },

    #[error("Duplicate identity id {id}")]
    DuplicateIdentity { id: u64 },

    #[error("Egress slot {slot} out of bounds (total points: {size})")]
    UnknownSlot { slot: usize, size: usize },
}

/// Session-level failures. Always fatal for the run.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Session handshake failed after {attempts} attempts: {reason}")]
    HandshakeFailed { attempts: u32, reason: String },

    #[error("Connection lost during submission #{attempt_seq}: {reason}")]
    Lost { attempt_seq: u64, reason: String },
}

/// Remote-classified failures of a single submission
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    #[error("Retryable remote error {code} (retry after {retry_after_ms}ms)")]
    Retryable { code: u16, retry_after_ms: u64 },

    #[error("Fatal remote error {code}")]
    Fatal { code: u16 },
}

/// A run that aborted on a fatal error, carrying the stats gathered so far.
#[derive(Error, Debug)]
#[error("Run aborted: {cause}")]
pub struct DispatchError {
    #[source]
    pub cause: CoreError,
    pub partial: StatsSnapshot,
}
