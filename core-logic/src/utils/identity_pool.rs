use crate::error::{ConfigError, CoreError, PoolError, PoolKind};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Account state as reported by the identity store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Limited,
    Fresh,
}

impl IdentityStatus {
    const ALL: [IdentityStatus; 3] = [
        IdentityStatus::Active,
        IdentityStatus::Limited,
        IdentityStatus::Fresh,
    ];
}

/// A reusable credential-like record rotated in least-recently-used order.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: u64,
    pub handle: String,
    pub credential_fingerprint: String,
    pub last_used: DateTime<Utc>,
    pub status: IdentityStatus,
}

impl Identity {
    pub fn new(id: u64, handle: impl Into<String>, last_used: DateTime<Utc>) -> Self {
        let handle = handle.into();
        Self {
            id,
            credential_fingerprint: fingerprint(id, &handle),
            handle,
            last_used,
            status: IdentityStatus::Fresh,
        }
    }

    pub fn with_status(mut self, status: IdentityStatus) -> Self {
        self.status = status;
        self
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .field("fingerprint", &self.credential_fingerprint)
            .field("last_used", &self.last_used)
            .field("status", &self.status)
            .finish()
    }
}

/// First 16 hex chars of SHA-256 over `"{id}:{handle}"`.
fn fingerprint(id: u64, handle: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}", id, handle).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
}

/// On-disk record; missing fields are filled in on load.
#[derive(Debug, Deserialize)]
struct IdentityRecord {
    id: u64,
    handle: String,
    #[serde(default)]
    status: Option<IdentityStatus>,
    #[serde(default)]
    last_used: Option<DateTime<Utc>>,
}

struct Rotation {
    heap: BinaryHeap<Reverse<(DateTime<Utc>, u64)>>,
    identities: HashMap<u64, Identity>,
    /// Latest stamp handed out; stamps are strictly increasing.
    last_stamp: Option<DateTime<Utc>>,
}

impl Rotation {
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

/// Fixed-size identity pool with least-recently-used selection.
///
/// Selection is a min-heap keyed by `(last_used, id)`, so ties fall to the
/// lowest id. All state sits behind one mutex; concurrent `next()` calls never
/// receive the same identity for the same rotation step.
pub struct IdentityPool {
    rotation: Mutex<Rotation>,
    size: usize,
}

impl IdentityPool {
    pub fn from_identities(identities: Vec<Identity>) -> Result<Self, CoreError> {
        let mut seen = HashSet::with_capacity(identities.len());
        for identity in &identities {
            if !seen.insert(identity.id) {
                return Err(PoolError::DuplicateIdentity { id: identity.id }.into());
            }
        }
        Ok(Self::build(identities))
    }

    fn build(identities: Vec<Identity>) -> Self {
        let heap = identities
            .iter()
            .map(|i| Reverse((i.last_used, i.id)))
            .collect();
        let by_id: HashMap<u64, Identity> = identities.into_iter().map(|i| (i.id, i)).collect();

        Self {
            size: by_id.len(),
            rotation: Mutex::new(Rotation {
                heap,
                identities: by_id,
                last_stamp: None,
            }),
        }
    }

    /// Simulates `n` identities with distinct ids and last-used times spread
    /// over the past week.
    pub fn load(n: usize) -> Self {
        let mut rng = rand::thread_rng();
        let mut ids = HashSet::with_capacity(n);
        let now = Utc::now();
        let mut identities = Vec::with_capacity(n);

        while identities.len() < n {
            let id = rng.gen_range(1_000_000_000u64..=9_999_999_999);
            if !ids.insert(id) {
                continue;
            }
            let handle = format!("acct-{:04}-{:06x}", identities.len() + 1, id & 0xff_ffff);
            let age = ChronoDuration::seconds(rng.gen_range(0..=7 * 86_400));
            let status = IdentityStatus::ALL[rng.gen_range(0..IdentityStatus::ALL.len())];
            identities.push(Identity::new(id, handle, now - age).with_status(status));
        }

        info!("Loaded {} simulated identities", identities.len());
        Self::build(identities)
    }

    /// Loads identities from a JSON array of `{id, handle, status?, last_used?}`.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        let records: Vec<IdentityRecord> = serde_json::from_str(&content).map_err(|e| {
            ConfigError::Parse {
                path: path.display().to_string(),
                msg: e.to_string(),
            }
        })?;

        // Records without a timestamp count as never used.
        let never = DateTime::<Utc>::MIN_UTC;
        let identities: Vec<Identity> = records
            .into_iter()
            .map(|r| {
                Identity::new(r.id, r.handle, r.last_used.unwrap_or(never))
                    .with_status(r.status.unwrap_or(IdentityStatus::Fresh))
            })
            .collect();

        info!(
            "Loaded {} identities from {}",
            identities.len(),
            path.display()
        );
        Ok(Self::from_identities(identities)?)
    }

    /// Returns the least-recently-used identity and marks it used now.
    pub async fn next(&self) -> Result<Identity, PoolError> {
        let mut rotation = self.rotation.lock().await;
        let Reverse((_, id)) = rotation.heap.pop().ok_or(PoolError::Empty {
            pool: PoolKind::Identity,
        })?;

        let stamp = rotation.stamp();
        rotation.heap.push(Reverse((stamp, id)));

        let identity = rotation
            .identities
            .get_mut(&id)
            .ok_or(PoolError::Empty {
                pool: PoolKind::Identity,
            })?;
        identity.last_used = stamp;
        debug!("Selected identity {} ({})", identity.id, identity.handle);
        Ok(identity.clone())
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Current state of every identity, ordered by id.
    pub async fn identities(&self) -> Vec<Identity> {
        let rotation = self.rotation.lock().await;
        let mut all: Vec<Identity> = rotation.identities.values().cloned().collect();
        all.sort_by_key(|i| i.id);
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Identity::new(42, "alice", Utc::now());
        let b = Identity::new(42, "alice", Utc::now());
        assert_eq!(a.credential_fingerprint, b.credential_fingerprint);
        assert_eq!(a.credential_fingerprint.len(), 16);
        assert_ne!(
            a.credential_fingerprint,
            Identity::new(43, "alice", Utc::now()).credential_fingerprint
        );
    }

    #[tokio::test]
    async fn test_simulated_load_has_distinct_ids() {
        let pool = IdentityPool::load(25);
        let identities = pool.identities().await;
        let ids: HashSet<u64> = identities.iter().map(|i| i.id).collect();
        assert_eq!(pool.len(), 25);
        assert_eq!(ids.len(), 25);
    }

    #[tokio::test]
    async fn test_rejects_duplicate_ids() {
        let now = Utc::now();
        let result = IdentityPool::from_identities(vec![
            Identity::new(1, "a", now),
            Identity::new(1, "b", now),
        ]);
        assert!(matches!(
            result,
            Err(CoreError::Pool(PoolError::DuplicateIdentity { id: 1 }))
        ));
    }
}
