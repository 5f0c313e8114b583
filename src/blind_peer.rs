//! Trust and assignment bookkeeping for blind peers.
//!
//! Peer keys arrive either as raw 32-byte keys or as an encoded string. Every
//! entry point runs the input through `canonicalize` first, so the trusted
//! set is always keyed by the lowercase hex form.

use anyhow::{anyhow, Result};
use base64::{
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
    Engine as _,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

use crate::config::BlindPeerConfig;
use crate::job::{Assignment, AssignmentStatus, Requester};
use crate::util::{is_hex_of_len, lock, now_ms};

pub const PEER_KEY_BYTES: usize = 32;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CanonicalKey(String);

impl CanonicalKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn raw(&self) -> [u8; PEER_KEY_BYTES] {
        let mut out = [0u8; PEER_KEY_BYTES];
        if let Ok(bytes) = hex::decode(&self.0) {
            out.copy_from_slice(&bytes);
        }
        out
    }
}

impl std::fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CanonicalKey {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        canonicalize(value.as_str())
    }
}

impl From<CanonicalKey> for String {
    fn from(key: CanonicalKey) -> Self {
        key.0
    }
}

/// The two shapes a peer key can take on the way in.
#[derive(Clone, Copy, Debug)]
pub enum PeerKeyInput<'a> {
    Bytes(&'a [u8]),
    Encoded(&'a str),
}

impl<'a> From<&'a [u8]> for PeerKeyInput<'a> {
    fn from(b: &'a [u8]) -> Self {
        PeerKeyInput::Bytes(b)
    }
}

impl<'a> From<&'a [u8; PEER_KEY_BYTES]> for PeerKeyInput<'a> {
    fn from(b: &'a [u8; PEER_KEY_BYTES]) -> Self {
        PeerKeyInput::Bytes(b.as_slice())
    }
}

impl<'a> From<&'a Vec<u8>> for PeerKeyInput<'a> {
    fn from(b: &'a Vec<u8>) -> Self {
        PeerKeyInput::Bytes(b.as_slice())
    }
}

impl<'a> From<&'a str> for PeerKeyInput<'a> {
    fn from(s: &'a str) -> Self {
        PeerKeyInput::Encoded(s)
    }
}

impl<'a> From<&'a String> for PeerKeyInput<'a> {
    fn from(s: &'a String) -> Self {
        PeerKeyInput::Encoded(s.as_str())
    }
}

impl<'a> From<&'a CanonicalKey> for PeerKeyInput<'a> {
    fn from(k: &'a CanonicalKey) -> Self {
        PeerKeyInput::Encoded(k.as_str())
    }
}

pub fn canonicalize<'a>(input: impl Into<PeerKeyInput<'a>>) -> Result<CanonicalKey> {
    match input.into() {
        PeerKeyInput::Bytes(bytes) if bytes.len() == PEER_KEY_BYTES => Ok(CanonicalKey(hex::encode(bytes))),
        // Buffers that carry an encoded key rather than the key itself.
        PeerKeyInput::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => canonicalize(s),
            Err(_) => Err(anyhow!("peer key must be {PEER_KEY_BYTES} bytes, got {}", bytes.len())),
        },
        PeerKeyInput::Encoded(s) => {
            let s = s.trim();
            if is_hex_of_len(s, PEER_KEY_BYTES * 2) {
                return Ok(CanonicalKey(s.to_ascii_lowercase()));
            }
            let decoded = URL_SAFE_NO_PAD
                .decode(s.trim_end_matches('='))
                .or_else(|_| STANDARD.decode(s))
                .map_err(|_| anyhow!("unrecognized peer key encoding"))?;
            if decoded.len() != PEER_KEY_BYTES {
                return Err(anyhow!("peer key must decode to {PEER_KEY_BYTES} bytes"));
            }
            Ok(CanonicalKey(hex::encode(decoded)))
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TrustedPeer {
    pub key: String,
}

#[derive(Clone, Debug)]
pub struct AssignmentRecord {
    pub job_id: String,
    pub peer_key: String,
    pub relay_key: String,
    pub filters: Vec<Value>,
    pub requester: Requester,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlindPeerStatus {
    pub enabled: bool,
    pub storage_dir: Option<String>,
    pub max_bytes: u64,
    pub trusted_peers: usize,
    pub assignments: usize,
}

pub struct BlindPeerService {
    config: BlindPeerConfig,
    persist_path: Option<PathBuf>,
    trusted: Mutex<BTreeMap<CanonicalKey, [u8; PEER_KEY_BYTES]>>,
    assignments: Mutex<HashMap<String, Assignment>>,
}

impl BlindPeerService {
    /// Builds the registry and loads any persisted trust list. Disabled mode
    /// only gates replication; the bookkeeping API always works.
    pub fn new(config: BlindPeerConfig) -> Self {
        let persist_path = config.trusted_peers_persist_path.as_ref().map(PathBuf::from);
        let mut trusted = BTreeMap::new();
        if let Some(path) = persist_path.as_ref() {
            match load_trusted(path) {
                Ok(keys) => {
                    for key in keys {
                        let raw = key.raw();
                        trusted.insert(key, raw);
                    }
                    tracing::info!(path = %path.display(), count = trusted.len(), "trusted peers loaded");
                }
                Err(err) => tracing::warn!(path = %path.display(), error = %err, "trusted peers load failed"),
            }
        }
        Self {
            config,
            persist_path,
            trusted: Mutex::new(trusted),
            assignments: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn config(&self) -> &BlindPeerConfig {
        &self.config
    }

    /// Returns true when the peer was not trusted before.
    pub fn add_trusted_peer<'a>(&self, key: impl Into<PeerKeyInput<'a>>) -> Result<bool> {
        let key = canonicalize(key)?;
        let mut guard = lock(&self.trusted);
        if guard.contains_key(&key) {
            return Ok(false);
        }
        let raw = key.raw();
        guard.insert(key.clone(), raw);
        tracing::info!(peer = %key, "trusted peer added");
        self.persist(&guard);
        Ok(true)
    }

    pub fn remove_trusted_peer<'a>(&self, key: impl Into<PeerKeyInput<'a>>) -> Result<bool> {
        let key = canonicalize(key)?;
        let mut guard = lock(&self.trusted);
        if guard.remove(&key).is_none() {
            return Ok(false);
        }
        tracing::info!(peer = %key, "trusted peer removed");
        self.persist(&guard);
        Ok(true)
    }

    /// Unparseable keys are simply not trusted.
    pub fn is_trusted_peer<'a>(&self, key: impl Into<PeerKeyInput<'a>>) -> bool {
        match canonicalize(key) {
            Ok(key) => lock(&self.trusted).contains_key(&key),
            Err(_) => false,
        }
    }

    pub fn get_trusted_peers(&self) -> Vec<TrustedPeer> {
        lock(&self.trusted)
            .keys()
            .map(|k| TrustedPeer { key: k.to_string() })
            .collect()
    }

    /// Records are keyed like the dispatcher's, by `Assignment::key`.
    pub fn record_dispatcher_assignment(&self, record: AssignmentRecord) -> Assignment {
        let assignment = Assignment {
            job_id: record.job_id,
            peer_id: record.peer_key,
            relay_key: record.relay_key,
            filters: record.filters,
            requester: record.requester,
            status: AssignmentStatus::Assigned,
            assigned_at: now_ms(),
            completed_at: None,
        };
        lock(&self.assignments).insert(assignment.key(), assignment.clone());
        tracing::debug!(job = %assignment.job_id, peer = %assignment.peer_id, "blind assignment recorded");
        assignment
    }

    pub fn get_dispatcher_assignments_snapshot(&self) -> Vec<Assignment> {
        let mut out: Vec<Assignment> = lock(&self.assignments).values().cloned().collect();
        out.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.job_id.cmp(&b.job_id)));
        out
    }

    /// Moves the record to `status` and stamps `completed_at`. Unknown jobs
    /// and backwards transitions are ignored.
    pub fn clear_dispatcher_assignment(&self, job_key: &str, status: AssignmentStatus) -> Option<Assignment> {
        let mut guard = lock(&self.assignments);
        let entry = guard.get_mut(job_key)?;
        if !entry.status.can_transition_to(status) {
            tracing::debug!(job = %job_key, from = ?entry.status, to = ?status, "assignment transition ignored");
            return None;
        }
        entry.status = status;
        entry.completed_at = Some(now_ms());
        Some(entry.clone())
    }

    /// Drops terminal assignments completed before `now - stale_core_ttl`.
    pub fn prune_stale_assignments(&self, now: u64) -> usize {
        let ttl = self.config.stale_core_ttl_ms;
        let mut guard = lock(&self.assignments);
        let before = guard.len();
        guard.retain(|_, a| match a.completed_at {
            Some(done) if a.status.is_terminal() => done.saturating_add(ttl) >= now,
            _ => true,
        });
        before - guard.len()
    }

    pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let every = self.config.gc_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(live) = registry.upgrade() else { break };
                let pruned = live.prune_stale_assignments(now_ms());
                if pruned > 0 {
                    tracing::debug!(pruned, "stale blind assignments pruned");
                }
            }
        })
    }

    pub fn status(&self) -> BlindPeerStatus {
        BlindPeerStatus {
            enabled: self.config.enabled,
            storage_dir: self.config.storage_dir.clone(),
            max_bytes: self.config.max_bytes(),
            trusted_peers: lock(&self.trusted).len(),
            assignments: lock(&self.assignments).len(),
        }
    }

    /// Called with the trusted set still locked so writes land in mutation
    /// order.
    fn persist(&self, trusted: &BTreeMap<CanonicalKey, [u8; PEER_KEY_BYTES]>) {
        let Some(path) = self.persist_path.as_ref() else { return };
        let keys: Vec<String> = trusted.keys().map(|k| k.to_string()).collect();
        if let Err(err) = save_trusted(path, &keys) {
            tracing::warn!(path = %path.display(), error = %err, "trusted peers persist failed");
        }
    }
}

fn load_trusted(path: &Path) -> Result<Vec<CanonicalKey>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)?;
    let entries: Vec<String> = serde_json::from_str(&raw)?;
    let mut out = Vec::with_capacity(entries.len());
    for entry in entries {
        match canonicalize(entry.as_str()) {
            Ok(key) => out.push(key),
            Err(err) => tracing::warn!(entry = %entry, error = %err, "skipping persisted peer key"),
        }
    }
    Ok(out)
}

fn save_trusted(path: &Path, keys: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, serde_json::to_string_pretty(keys)?)?;
    Ok(())
}
