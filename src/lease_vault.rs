//! Ephemeral writer-key leases, one live lease per relay.
//!
//! Secrets are held in zeroizing buffers behind `SecretHandle`. Read paths
//! return `LeaseSummary`, which has no secret field at all; only `track` and
//! `get_with_secret` hand out a `LeaseFull`.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use zeroize::Zeroizing;

use crate::util::{lock, now_ms};

#[derive(Clone)]
pub struct SecretHandle(Arc<Zeroizing<Vec<u8>>>);

impl SecretHandle {
    fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::new(Zeroizing::new(bytes)))
    }

    pub fn expose(&self) -> &[u8] {
        self.0.as_slice()
    }
}

impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretHandle(<redacted>)")
    }
}

/// Writer key as supplied by the caller: raw bytes or a hex string.
#[derive(Clone, Debug)]
pub enum WriterSecret {
    Bytes(Vec<u8>),
    Hex(String),
}

impl WriterSecret {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            WriterSecret::Bytes(b) => b,
            WriterSecret::Hex(h) => match hex::decode(h.trim()) {
                Ok(b) => b,
                Err(_) => h.into_bytes(),
            },
        }
    }
}

#[derive(Clone, Debug)]
pub struct WriterPackageInput {
    pub writer_key: WriterSecret,
    pub owner_peer_key: String,
}

#[derive(Clone, Debug, Default)]
pub struct TrackRequest {
    pub relay_key: String,
    pub lease_id: String,
    pub writer_package: Option<WriterPackageInput>,
    pub escrow_id: Option<String>,
    pub expires_at: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct WriterPackage {
    pub writer_key_secret: SecretHandle,
    pub writer_key_digest: String,
    pub owner_peer_key: String,
}

#[derive(Clone, Debug)]
pub struct LeaseFull {
    pub relay_key: String,
    pub lease_id: String,
    pub escrow_id: Option<String>,
    pub writer_package: Option<WriterPackage>,
    pub expires_at: Option<u64>,
    pub tracked_at: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSummary {
    pub relay_key: String,
    pub lease_id: String,
    pub escrow_id: Option<String>,
    pub payload_digest: Option<String>,
    pub owner_peer_key: Option<String>,
    pub expires_at: Option<u64>,
    pub tracked_at: u64,
}

impl LeaseFull {
    pub fn summary(&self) -> LeaseSummary {
        LeaseSummary {
            relay_key: self.relay_key.clone(),
            lease_id: self.lease_id.clone(),
            escrow_id: self.escrow_id.clone(),
            payload_digest: self.writer_package.as_ref().map(|p| p.writer_key_digest.clone()),
            owner_peer_key: self.writer_package.as_ref().map(|p| p.owner_peer_key.clone()),
            expires_at: self.expires_at,
            tracked_at: self.tracked_at,
        }
    }

    fn expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(exp) if exp < now)
    }
}

#[derive(Clone, Debug)]
pub struct LeaseVaultOptions {
    pub wipe_on_shutdown: bool,
}

impl Default for LeaseVaultOptions {
    fn default() -> Self {
        Self {
            wipe_on_shutdown: true,
        }
    }
}

pub struct LeaseVault {
    leases: Mutex<HashMap<String, LeaseFull>>,
    options: LeaseVaultOptions,
}

impl LeaseVault {
    pub fn new(options: LeaseVaultOptions) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Stores the lease, superseding any earlier lease for the same relay.
    pub fn track(&self, req: TrackRequest) -> LeaseFull {
        let writer_package = req.writer_package.map(|pkg| {
            let bytes = pkg.writer_key.into_bytes();
            let digest = hex::encode(Sha256::digest(&bytes));
            WriterPackage {
                writer_key_secret: SecretHandle::new(bytes),
                writer_key_digest: digest,
                owner_peer_key: pkg.owner_peer_key,
            }
        });
        let lease = LeaseFull {
            relay_key: req.relay_key.clone(),
            lease_id: req.lease_id,
            escrow_id: req.escrow_id,
            writer_package,
            expires_at: req.expires_at,
            tracked_at: now_ms(),
        };
        let previous = lock(&self.leases).insert(req.relay_key.clone(), lease.clone());
        if let Some(prev) = previous {
            tracing::debug!(relay = %req.relay_key, lease = %prev.lease_id, "lease superseded");
        }
        tracing::info!(relay = %lease.relay_key, lease = %lease.lease_id, "lease tracked");
        lease
    }

    pub fn get(&self, relay_key: &str) -> Option<LeaseSummary> {
        self.live(relay_key).map(|l| l.summary())
    }

    pub fn get_with_secret(&self, relay_key: &str) -> Option<LeaseFull> {
        self.live(relay_key)
    }

    pub fn list(&self) -> Vec<LeaseSummary> {
        let now = now_ms();
        let mut out: Vec<LeaseSummary> = lock(&self.leases)
            .values()
            .filter(|l| !l.expired(now))
            .map(|l| l.summary())
            .collect();
        out.sort_by(|a, b| a.relay_key.cmp(&b.relay_key));
        out
    }

    pub fn release(&self, relay_key: &str, reason: &str) -> Option<LeaseSummary> {
        let removed = lock(&self.leases).remove(relay_key)?;
        tracing::info!(relay = %relay_key, lease = %removed.lease_id, reason, "lease released");
        Some(removed.summary())
    }

    pub fn release_by_escrow_id(&self, escrow_id: &str, reason: &str) -> Vec<LeaseSummary> {
        let released = self.drain_where(|l| l.escrow_id.as_deref() == Some(escrow_id));
        tracing::info!(escrow = %escrow_id, count = released.len(), reason, "escrow leases released");
        released
    }

    /// Releases every lease whose `expires_at` is strictly before `now`.
    pub fn release_expired(&self, now: u64) -> Vec<LeaseSummary> {
        let released = self.drain_where(|l| l.expired(now));
        if !released.is_empty() {
            tracing::info!(count = released.len(), "expired leases released");
        }
        released
    }

    /// Drops every held secret. Returns how many leases were wiped.
    pub fn wipe_all(&self) -> usize {
        let mut guard = lock(&self.leases);
        let count = guard.len();
        guard.clear();
        count
    }

    pub fn spawn_expiry_sweep(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let vault = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
            loop {
                ticker.tick().await;
                match vault.upgrade() {
                    Some(vault) => {
                        vault.release_expired(now_ms());
                    }
                    None => break,
                }
            }
        })
    }

    /// Wipes all secrets once `signal` resolves. The binary passes Ctrl-C;
    /// tests pass their own future or skip this entirely.
    pub fn spawn_shutdown_wipe<F>(self: &Arc<Self>, signal: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.options.wipe_on_shutdown {
            return None;
        }
        let vault = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            signal.await;
            match vault.upgrade() {
                Some(vault) => {
                    let wiped = vault.wipe_all();
                    tracing::info!(wiped, "lease secrets wiped on shutdown");
                }
                None => tracing::warn!("lease vault gone before shutdown wipe"),
            }
        }))
    }

    fn live(&self, relay_key: &str) -> Option<LeaseFull> {
        let now = now_ms();
        lock(&self.leases)
            .get(relay_key)
            .filter(|l| !l.expired(now))
            .cloned()
    }

    fn drain_where<P>(&self, pred: P) -> Vec<LeaseSummary>
    where
        P: Fn(&LeaseFull) -> bool,
    {
        let mut guard = lock(&self.leases);
        let keys: Vec<String> = guard
            .iter()
            .filter(|(_, l)| pred(l))
            .map(|(k, _)| k.clone())
            .collect();
        let mut out: Vec<LeaseSummary> = keys
            .iter()
            .filter_map(|k| guard.remove(k))
            .map(|l| l.summary())
            .collect();
        out.sort_by(|a, b| a.relay_key.cmp(&b.relay_key));
        out
    }
}
