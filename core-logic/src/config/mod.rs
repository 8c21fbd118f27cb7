use crate::error::ConfigError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MIN_COUNT: u32 = 1;
pub const MAX_COUNT: u32 = 500;
pub const MIN_DELAY_SECS: f64 = 0.1;
pub const MAX_DELAY_SECS: f64 = 5.0;
/// Longest cooldown a retry may be scheduled for: one week
pub const MAX_RETRY_AFTER_MS: u64 = 7 * 24 * 3_600_000;

/// A validated submission job handed over by the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub target: String,
    pub reason: String,
    pub count: u32,
    /// Inter-attempt delay in seconds
    pub delay: f64,
}

impl JobRequest {
    pub fn new(target: impl Into<String>, reason: impl Into<String>, count: u32, delay: f64) -> Self {
        Self {
            target: target.into(),
            reason: reason.into(),
            count,
            delay,
        }
    }

    /// Checks the job against the accepted input ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target.trim().is_empty() {
            return Err(ConfigError::MissingField {
                field: "target".to_string(),
            });
        }
        if !(MIN_COUNT..=MAX_COUNT).contains(&self.count) {
            return Err(ConfigError::InvalidValue {
                field: "count".to_string(),
                reason: format!(
                    "{} is outside [{}, {}]",
                    self.count, MIN_COUNT, MAX_COUNT
                ),
            });
        }
        if !self.delay.is_finite() || !(MIN_DELAY_SECS..=MAX_DELAY_SECS).contains(&self.delay) {
            return Err(ConfigError::InvalidValue {
                field: "delay".to_string(),
                reason: format!(
                    "{} is outside [{}, {}] seconds",
                    self.delay, MIN_DELAY_SECS, MAX_DELAY_SECS
                ),
            });
        }
        Ok(())
    }

    pub fn delay_duration(&self) -> Duration {
        Duration::from_secs_f64(self.delay)
    }
}

/// What to do with egress points whose liveness probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EgressPolicy {
    /// Route through every point regardless of probe result
    #[default]
    UseAll,
    /// Skip unverified points while a verified one exists
    SkipUnverified,
}

impl std::str::FromStr for EgressPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "use_all" | "all" => Ok(EgressPolicy::UseAll),
            "skip_unverified" | "verified" => Ok(EgressPolicy::SkipUnverified),
            other => Err(ConfigError::InvalidValue {
                field: "egress_policy".to_string(),
                reason: format!("unknown policy '{}'", other),
            }),
        }
    }
}

/// Engine tuning knobs. Every field has a default so a partial TOML file works.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Retries granted to a request after its first retryable failure
    pub max_retries: u32,
    /// Lower bound of the random backoff used when the remote gives no cooldown
    pub backoff_min_ms: u64,
    /// Upper bound of the random backoff used when the remote gives no cooldown
    pub backoff_max_ms: u64,
    /// Handshake attempts before the session is declared unreachable
    pub session_open_attempts: u32,
    pub session_retry_base_ms: u64,
    /// Simulated identities created when no identity file is configured
    pub identity_count: usize,
    pub identity_file: Option<PathBuf>,
    pub egress_file: PathBuf,
    /// Size of the synthesized egress list when the file is absent or empty
    pub egress_synth_size: usize,
    pub probe_on_first_use: bool,
    pub probe_timeout_ms: u64,
    pub egress_policy: EgressPolicy,
    /// Upper bound on any cooldown before a retry, server-provided ones included
    pub max_retry_after_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_min_ms: 5_000,
            backoff_max_ms: 60_000,
            session_open_attempts: 3,
            session_retry_base_ms: 500,
            identity_count: 10,
            identity_file: None,
            egress_file: PathBuf::from("proxies.txt"),
            egress_synth_size: 20,
            probe_on_first_use: true,
            probe_timeout_ms: 3_000,
            egress_policy: EgressPolicy::UseAll,
            max_retry_after_ms: 3_600_000,
        }
    }
}

impl DispatchConfig {
    /// Load configuration from a TOML file
    ///
    /// # Example
    /// ```ignore
    /// let config = DispatchConfig::from_path("config/fanout.toml")?;
    /// ```
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `FANOUT_*` environment overrides on top of the loaded values.
    pub fn apply_env(mut self) -> Result<Self> {
        if let Some(v) = env_var("FANOUT_MAX_RETRIES") {
            self.max_retries = parse_env("FANOUT_MAX_RETRIES", &v)?;
        }
        if let Some(v) = env_var("FANOUT_IDENTITY_COUNT") {
            self.identity_count = parse_env("FANOUT_IDENTITY_COUNT", &v)?;
        }
        if let Some(v) = env_var("FANOUT_PROBE_TIMEOUT_MS") {
            self.probe_timeout_ms = parse_env("FANOUT_PROBE_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = env_var("FANOUT_EGRESS_FILE") {
            self.egress_file = PathBuf::from(v);
        }
        if let Some(v) = env_var("FANOUT_IDENTITY_FILE") {
            self.identity_file = Some(PathBuf::from(v));
        }
        if let Some(v) = env_var("FANOUT_EGRESS_POLICY") {
            self.egress_policy = v.parse()?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_min_ms > self.backoff_max_ms {
            return Err(ConfigError::InvalidValue {
                field: "backoff_min_ms".to_string(),
                reason: format!(
                    "{} exceeds backoff_max_ms {}",
                    self.backoff_min_ms, self.backoff_max_ms
                ),
            });
        }
        if self.session_open_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session_open_attempts".to_string(),
                reason: "at least one handshake attempt is required".to_string(),
            });
        }
        if self.max_retry_after_ms == 0 || self.max_retry_after_ms > MAX_RETRY_AFTER_MS {
            return Err(ConfigError::InvalidValue {
                field: "max_retry_after_ms".to_string(),
                reason: format!(
                    "{} is outside [1, {}]",
                    self.max_retry_after_ms, MAX_RETRY_AFTER_MS
                ),
            });
        }
        if self.identity_file.is_none() && self.identity_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "identity_count".to_string(),
                reason: "must be positive when no identity file is configured".to_string(),
            });
        }
        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_millis(self.max_retry_after_ms)
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        field: key.to_string(),
        reason: format!("cannot parse '{}'", value),
    })
}
