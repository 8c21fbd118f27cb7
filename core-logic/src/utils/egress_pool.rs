//! # Egress Pool
//!
//! Round-robin rotation over proxy descriptors, with persistence of the
//! descriptor list and liveness probing.
//!
//! The list lives in a plain text file, one `scheme://host:port` per line.
//! When the file is missing or holds no usable line, a list of pseudo-random
//! descriptors is synthesized and written back so later runs reuse it.

use crate::error::{ConfigError, PoolError, PoolKind};
use crate::traits::EgressProber;
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub const DEFAULT_SYNTH_SIZE: usize = 20;

const NO_LATENCY: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EgressScheme {
    Socks5,
    Http,
    Https,
}

impl EgressScheme {
    const ALL: [EgressScheme; 3] = [EgressScheme::Socks5, EgressScheme::Http, EgressScheme::Https];

    pub fn as_str(&self) -> &'static str {
        match self {
            EgressScheme::Socks5 => "socks5",
            EgressScheme::Http => "http",
            EgressScheme::Https => "https",
        }
    }
}

impl FromStr for EgressScheme {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" => Ok(EgressScheme::Socks5),
            "http" => Ok(EgressScheme::Http),
            "https" => Ok(EgressScheme::Https),
            other => Err(ConfigError::InvalidEgress {
                line: s.to_string(),
                reason: format!("unsupported scheme '{}'", other),
            }),
        }
    }
}

/// Snapshot of one proxy descriptor and its last probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EgressPoint {
    pub scheme: EgressScheme,
    pub host: String,
    pub port: u16,
    pub last_latency_ms: Option<f64>,
    pub verified: bool,
}

impl EgressPoint {
    pub fn new(scheme: EgressScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            last_latency_ms: None,
            verified: false,
        }
    }

    /// Stable identifier, identical to the persisted form.
    pub fn id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EgressPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

impl FromStr for EgressPoint {
    type Err = ConfigError;

    /// Parses `scheme://host:port`; IPv6 hosts must be bracketed.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidEgress {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = line.split_once("://").ok_or_else(|| invalid("missing '://'"))?;
        let scheme: EgressScheme = scheme.parse()?;
        let (host, port) = match rest.strip_prefix('[') {
            Some(bracketed) => bracketed
                .split_once("]:")
                .ok_or_else(|| invalid("unterminated IPv6 literal or missing port"))?,
            None => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
                if host.contains(':') {
                    return Err(invalid("IPv6 hosts must be written as [addr]"));
                }
                (host, port)
            }
        };
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a valid u16"))?;
        if port == 0 {
            return Err(invalid("port must be non-zero"));
        }

        Ok(EgressPoint::new(scheme, host, port))
    }
}

/// Outcome of a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeResult {
    pub alive: bool,
    pub latency_ms: Option<f64>,
}

impl ProbeResult {
    pub fn alive(latency_ms: f64) -> Self {
        Self {
            alive: true,
            latency_ms: Some(latency_ms),
        }
    }

    pub fn dead() -> Self {
        Self {
            alive: false,
            latency_ms: None,
        }
    }
}

/// A rotation slot handed out by [`EgressPool::next`].
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedEgress {
    pub slot: usize,
    pub point: EgressPoint,
}

#[derive(Debug)]
struct EgressSlot {
    scheme: EgressScheme,
    host: String,
    port: u16,
    last_latency_bits: AtomicU64,
    verified: AtomicBool,
    probes: AtomicU64,
}

impl EgressSlot {
    fn new(point: &EgressPoint) -> Self {
        Self {
            scheme: point.scheme,
            host: point.host.clone(),
            port: point.port,
            last_latency_bits: AtomicU64::new(
                point.last_latency_ms.map(f64::to_bits).unwrap_or(NO_LATENCY),
            ),
            verified: AtomicBool::new(point.verified),
            probes: AtomicU64::new(0),
        }
    }

    fn latency_ms(&self) -> Option<f64> {
        match self.last_latency_bits.load(Ordering::SeqCst) {
            NO_LATENCY => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    fn snapshot(&self) -> EgressPoint {
        EgressPoint {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port,
            last_latency_ms: self.latency_ms(),
            verified: self.verified.load(Ordering::SeqCst),
        }
    }

    fn record_probe(&self, result: &ProbeResult) {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.verified.store(result.alive, Ordering::SeqCst);
        self.last_latency_bits.store(
            result.latency_ms.map(f64::to_bits).unwrap_or(NO_LATENCY),
            Ordering::SeqCst,
        );
    }
}

/// Round-robin pool of egress points.
///
/// The rotation cursor is a single atomic counter, so concurrent callers of
/// [`next`](Self::next) each get their own rotation step. Probe results are
/// stored per slot and never remove a point from rotation; skipping
/// unverified points is the caller's policy.
#[derive(Debug)]
pub struct EgressPool {
    slots: Vec<EgressSlot>,
    current_index: AtomicUsize,
}

impl EgressPool {
    pub fn from_points(points: Vec<EgressPoint>) -> Self {
        Self {
            slots: points.iter().map(EgressSlot::new).collect(),
            current_index: AtomicUsize::new(0),
        }
    }

    /// Loads descriptors from `path`, synthesizing and persisting
    /// `synth_size` points when the file is absent or holds no descriptor
    /// lines. A file with descriptor lines is never rewritten; if none of
    /// them parse, loading fails.
    pub fn load(path: impl AsRef<Path>, synth_size: usize) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
                path: path.display().to_string(),
                msg: e.to_string(),
            })?;
            let lines = descriptor_lines(&content).count();
            if lines > 0 {
                let points = parse_descriptors(&content);
                if points.is_empty() {
                    return Err(ConfigError::InvalidEgress {
                        line: path.display().to_string(),
                        reason: format!("none of the {} descriptor lines is valid", lines),
                    }
                    .into());
                }
                info!("Loaded {} egress points from {}", points.len(), path.display());
                return Ok(Self::from_points(points));
            }
            warn!("{} is empty. Synthesizing egress list.", path.display());
        } else {
            warn!("{} not found. Synthesizing egress list.", path.display());
        }

        let pool = Self::from_points(synthesize(synth_size));
        info!("Synthesized {} egress points", pool.len());
        if let Err(e) = pool.persist(path) {
            warn!("Could not persist egress list to {}: {:#}", path.display(), e);
        }
        Ok(pool)
    }

    /// Writes the current descriptors, one per line.
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .context(format!("Failed to create {}", parent.display()))?;
        }
        let mut content = String::new();
        for point in self.points() {
            content.push_str(&point.to_string());
            content.push('\n');
        }
        fs::write(path, content).context(format!("Failed to write {}", path.display()))?;
        debug!("Persisted {} egress points to {}", self.len(), path.display());
        Ok(())
    }

    /// Next point in round-robin order, wrapping at the end.
    pub fn next(&self) -> Result<SelectedEgress, PoolError> {
        if self.slots.is_empty() {
            return Err(PoolError::Empty {
                pool: PoolKind::Egress,
            });
        }
        let slot = self.current_index.fetch_add(1, Ordering::SeqCst) % self.slots.len();
        Ok(SelectedEgress {
            slot,
            point: self.slots[slot].snapshot(),
        })
    }

    /// Probes one slot and records the result. Only `verified` and
    /// `last_latency_ms` change; calling it repeatedly is safe.
    pub async fn probe(
        &self,
        slot: usize,
        prober: &dyn EgressProber,
    ) -> Result<ProbeResult, PoolError> {
        let entry = self
            .slots
            .get(slot)
            .ok_or(PoolError::UnknownSlot { slot, size: self.slots.len() })?;
        let point = entry.snapshot();

        let result = prober.probe(&point).await;
        entry.record_probe(&result);

        match result.latency_ms {
            Some(ms) if result.alive => debug!("Egress {} OK - latency {:.0}ms", point, ms),
            _ => debug!("Egress {} failed probe", point),
        }
        Ok(result)
    }

    /// Probes every point, `concurrency` at a time. Returns (healthy, unhealthy).
    pub async fn probe_all(&self, prober: &dyn EgressProber, concurrency: usize) -> (usize, usize) {
        info!(
            "Probing {} egress points ({} concurrent)...",
            self.slots.len(),
            concurrency
        );

        let results: Vec<bool> = stream::iter(0..self.slots.len())
            .map(|slot| async move {
                self.probe(slot, prober)
                    .await
                    .map(|r| r.alive)
                    .unwrap_or(false)
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let healthy = results.iter().filter(|alive| **alive).count();
        let unhealthy = results.len() - healthy;
        info!("Egress probe complete: {} healthy, {} unhealthy", healthy, unhealthy);
        (healthy, unhealthy)
    }

    /// Number of times a slot has been probed.
    pub fn probe_count(&self, slot: usize) -> u64 {
        self.slots
            .get(slot)
            .map(|s| s.probes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn points(&self) -> Vec<EgressPoint> {
        self.slots.iter().map(EgressSlot::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn verified_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.verified.load(Ordering::SeqCst))
            .count()
    }
}

/// Non-blank lines that are not `#` comments.
fn descriptor_lines(content: &str) -> impl Iterator<Item = &str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
}

fn parse_descriptors(content: &str) -> Vec<EgressPoint> {
    let mut points = Vec::new();
    for line in descriptor_lines(content) {
        match line.parse::<EgressPoint>() {
            Ok(point) => points.push(point),
            Err(e) => warn!("Skipping invalid egress line: {}", e),
        }
    }
    points
}

/// Pseudo-random descriptors: random scheme, dotted-quad host, port 8000-65000.
pub fn synthesize(count: usize) -> Vec<EgressPoint> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let scheme = EgressScheme::ALL[rng.gen_range(0..EgressScheme::ALL.len())];
            let host = format!(
                "{}.{}.{}.{}",
                rng.gen_range(1..=255u8),
                rng.gen_range(1..=255u8),
                rng.gen_range(1..=255u8),
                rng.gen_range(1..=255u8)
            );
            EgressPoint::new(scheme, host, rng.gen_range(8000..=65000))
        })
        .collect()
}

/// Probes by opening a TCP connection to the proxy itself.
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProber {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[async_trait]
impl EgressProber for TcpProber {
    async fn probe(&self, point: &EgressPoint) -> ProbeResult {
        let started = Instant::now();
        let connect = TcpStream::connect((point.host.as_str(), point.port));
        match tokio::time::timeout(self.timeout, connect).await {
            Ok(Ok(_stream)) => ProbeResult::alive(started.elapsed().as_secs_f64() * 1000.0),
            Ok(Err(e)) => {
                debug!("Egress {} unreachable: {}", point, e);
                ProbeResult::dead()
            }
            Err(_) => {
                debug!("Egress {} timed out after {:?}", point, self.timeout);
                ProbeResult::dead()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descriptor() {
        let point: EgressPoint = "socks5://10.1.2.3:1080".parse().unwrap();
        assert_eq!(point.scheme, EgressScheme::Socks5);
        assert_eq!(point.host, "10.1.2.3");
        assert_eq!(point.port, 1080);
        assert!(!point.verified);
        assert_eq!(point.id(), "socks5://10.1.2.3:1080");
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let point: EgressPoint = "socks5://[2001:db8::1]:1080".parse().unwrap();
        assert_eq!(point.host, "2001:db8::1");
        assert_eq!(point.port, 1080);
        assert_eq!(point.to_string(), "socks5://[2001:db8::1]:1080");

        assert!("socks5://2001:db8::1:1080".parse::<EgressPoint>().is_err());
        assert!("socks5://[2001:db8::1:1080".parse::<EgressPoint>().is_err());
        assert!("socks5://[]:1080".parse::<EgressPoint>().is_err());
    }

    #[tokio::test]
    async fn test_tcp_prober_reaches_ipv6_point() {
        let Ok(listener) = tokio::net::TcpListener::bind("[::1]:0").await else {
            // Host without IPv6 loopback
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let point: EgressPoint = format!("http://[::1]:{}", port).parse().unwrap();

        let result = TcpProber::new(Duration::from_secs(2)).probe(&point).await;
        assert!(result.alive);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("10.1.2.3:1080".parse::<EgressPoint>().is_err());
        assert!("ftp://10.1.2.3:21".parse::<EgressPoint>().is_err());
        assert!("http://10.1.2.3:notaport".parse::<EgressPoint>().is_err());
        assert!("http://:8080".parse::<EgressPoint>().is_err());
    }

    #[test]
    fn test_parse_skips_comments_and_invalid_lines() {
        let content = "# proxies\n\nhttp://1.1.1.1:8080\nbogus\nhttps://2.2.2.2:8443\n";
        let points = parse_descriptors(content);
        assert_eq!(points.len(), 2);
        assert_eq!(points[1].to_string(), "https://2.2.2.2:8443");
    }

    #[test]
    fn test_synthesized_points_are_in_range() {
        for point in synthesize(50) {
            assert!((8000..=65000).contains(&point.port));
            assert_eq!(point.host.split('.').count(), 4);
            let reparsed: EgressPoint = point.to_string().parse().unwrap();
            assert_eq!(reparsed.host, point.host);
        }
    }

    #[test]
    fn test_empty_pool_next_fails() {
        let pool = EgressPool::from_points(Vec::new());
        assert!(matches!(
            pool.next(),
            Err(PoolError::Empty {
                pool: PoolKind::Egress
            })
        ));
    }

    #[tokio::test]
    async fn test_tcp_prober_marks_closed_port_dead() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let prober = TcpProber::new(Duration::from_millis(500));
        let result = prober
            .probe(&EgressPoint::new(EgressScheme::Http, "127.0.0.1", port))
            .await;
        assert!(!result.alive);
        assert!(result.latency_ms.is_none());
    }

    #[tokio::test]
    async fn test_tcp_prober_measures_open_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let prober = TcpProber::new(Duration::from_secs(2));
        let result = prober
            .probe(&EgressPoint::new(EgressScheme::Socks5, "127.0.0.1", port))
            .await;
        assert!(result.alive);
        assert!(result.latency_ms.is_some());
    }
}
