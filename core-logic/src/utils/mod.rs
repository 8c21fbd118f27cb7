//! # Utilities Module
//!
//! Resource pools, retry plumbing, logging and the foreground runner.

pub mod egress_pool;
pub mod identity_pool;
pub(crate) mod logger;
pub mod retry;
pub mod retry_queue;
pub(crate) mod runner;

pub use egress_pool::{EgressPoint, EgressPool, EgressScheme, ProbeResult, SelectedEgress, TcpProber};
pub use identity_pool::{Identity, IdentityPool, IdentityStatus};
pub use logger::setup_logger;
pub use retry_queue::{RetryQueue, RetryQueueEntry};
pub use runner::JobRunner;
