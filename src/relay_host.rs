//! Gateway-hosted relay: an append-only event log with an ordered index.
//!
//! The log is a JSON-lines file under the storage directory and is replayed
//! on `initialize`. Appends are serialized through one async lock; telemetry
//! runs on its own timer and only reads atomics, so it never blocks writers.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

use crate::nostr::{self, AdminKeyPair, NostrEvent};
use crate::observer::{Observers, Subscription};
use crate::util::lock;
use crate::util::now_ms;

pub const LOG_FILE_NAME: &str = "events.log";
pub const REASON_NOT_WRITABLE: &str = "host-not-writable";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostState {
    NotStarted,
    Started,
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum TelemetryEvent {
    #[serde(rename = "replication")]
    Replication {
        length: u64,
        indexed: u64,
        writer: String,
        ts: u64,
    },
    #[serde(rename = "hyperbee-append")]
    Append {
        id: String,
        kind: u32,
        seq: u64,
        ts: u64,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Accepted { id: String },
    Rejected { reason: String },
}

impl ApplyOutcome {
    fn rejected(reason: &str) -> Self {
        ApplyOutcome::Rejected {
            reason: reason.to_string(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct HostOptions {
    pub telemetry_interval: Duration,
    pub verify_signatures: bool,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            telemetry_interval: Duration::from_secs(5),
            verify_signatures: false,
        }
    }
}

struct Storage {
    dir: PathBuf,
    admin: AdminKeyPair,
    stats_interval: Duration,
    log: File,
    events: Vec<NostrEvent>,
    by_id: HashMap<String, u64>,
    ordered: BTreeMap<(u64, String), u64>,
}

impl Storage {
    fn index(&mut self, ev: NostrEvent) -> u64 {
        let seq = self.events.len() as u64;
        self.by_id.insert(ev.id.clone(), seq);
        self.ordered.insert((ev.created_at, ev.id.clone()), seq);
        self.events.push(ev);
        seq
    }
}

pub struct ReplicatedRelayHost {
    options: HostOptions,
    state: Mutex<HostState>,
    storage: tokio::sync::Mutex<Option<Storage>>,
    length: AtomicU64,
    writer: Mutex<String>,
    sinks: Observers<TelemetryEvent>,
    telemetry_task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicatedRelayHost {
    pub fn new(options: HostOptions) -> Self {
        Self {
            options,
            state: Mutex::new(HostState::NotStarted),
            storage: tokio::sync::Mutex::new(None),
            length: AtomicU64::new(0),
            writer: Mutex::new(String::new()),
            sinks: Observers::new(),
            telemetry_task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> HostState {
        *lock(&self.state)
    }

    pub fn length(&self) -> u64 {
        self.length.load(Ordering::SeqCst)
    }

    /// Opens (or creates) the log under `storage_dir` and rebuilds the index.
    /// Calling again with the same parameters is a no-op.
    pub async fn initialize(
        &self,
        storage_dir: &Path,
        admin: AdminKeyPair,
        stats_interval: Option<Duration>,
    ) -> Result<()> {
        let stats_interval = stats_interval.unwrap_or(self.options.telemetry_interval);
        let mut guard = self.storage.lock().await;
        if let Some(existing) = guard.as_ref() {
            if existing.dir == storage_dir && existing.admin == admin && existing.stats_interval == stats_interval {
                return Ok(());
            }
            return Err(anyhow!("relay host already initialized with different parameters"));
        }

        tokio::fs::create_dir_all(storage_dir).await?;
        let path = storage_dir.join(LOG_FILE_NAME);
        let mut storage = Storage {
            dir: storage_dir.to_path_buf(),
            admin: admin.clone(),
            stats_interval,
            log: OpenOptions::new().create(true).append(true).open(&path).await?,
            events: Vec::new(),
            by_id: HashMap::new(),
            ordered: BTreeMap::new(),
        };
        for ev in replay_log(&path).await? {
            storage.index(ev);
        }
        self.length.store(storage.events.len() as u64, Ordering::SeqCst);
        *lock(&self.writer) = admin.pubkey.clone();
        tracing::info!(dir = %storage_dir.display(), length = storage.events.len(), "relay host initialized");
        *guard = Some(storage);
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let interval = match self.storage.lock().await.as_ref() {
            Some(storage) => storage.stats_interval,
            None => return Err(anyhow!("relay host not initialized")),
        };
        {
            let mut state = lock(&self.state);
            match *state {
                HostState::Started => return Ok(()),
                HostState::Stopped => return Err(anyhow!("relay host already stopped")),
                HostState::NotStarted => *state = HostState::Started,
            }
        }
        let host = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(host) = host.upgrade() else { break };
                if host.state() != HostState::Started {
                    break;
                }
                host.emit_replication();
            }
        });
        *lock(&self.telemetry_task) = Some(task);
        tracing::info!("relay host started");
        Ok(())
    }

    pub fn stop(&self) {
        let was = std::mem::replace(&mut *lock(&self.state), HostState::Stopped);
        if let Some(task) = lock(&self.telemetry_task).take() {
            task.abort();
        }
        if was != HostState::Stopped {
            tracing::info!("relay host stopped");
        }
    }

    pub fn register_telemetry_sink<F>(&self, sink: F) -> Subscription
    where
        F: Fn(&TelemetryEvent) + Send + Sync + 'static,
    {
        self.sinks.subscribe(sink)
    }

    /// Validates and appends one event. Admission failures are returned as
    /// `Rejected`; log I/O failures propagate as errors.
    pub async fn apply_event(&self, raw: &Value) -> Result<ApplyOutcome> {
        if self.state() != HostState::Started {
            return Ok(ApplyOutcome::rejected(REASON_NOT_WRITABLE));
        }
        let ev = match nostr::parse_structural(raw) {
            Ok(ev) => ev,
            Err(reason) => return Ok(ApplyOutcome::rejected(reason)),
        };
        if self.options.verify_signatures && !nostr::verify_event(&ev).unwrap_or(false) {
            return Ok(ApplyOutcome::rejected("invalid: bad signature"));
        }

        let appended = {
            let mut guard = self.storage.lock().await;
            let storage = match guard.as_mut() {
                Some(s) if self.state() == HostState::Started => s,
                _ => return Ok(ApplyOutcome::rejected(REASON_NOT_WRITABLE)),
            };
            if storage.by_id.contains_key(&ev.id) {
                None
            } else {
                let mut line = serde_json::to_string(&ev)?;
                line.push('\n');
                storage.log.write_all(line.as_bytes()).await?;
                storage.log.flush().await?;
                let kind = ev.kind;
                let seq = storage.index(ev.clone());
                self.length.store(storage.events.len() as u64, Ordering::SeqCst);
                Some((seq, kind))
            }
        };

        if let Some((seq, kind)) = appended {
            tracing::debug!(id = %ev.id, seq, "event appended");
            self.sinks.emit(&TelemetryEvent::Append {
                id: ev.id.clone(),
                kind,
                seq,
                ts: now_ms(),
            });
        }
        Ok(ApplyOutcome::Accepted { id: ev.id })
    }

    pub async fn get_event(&self, id: &str) -> Option<NostrEvent> {
        let guard = self.storage.lock().await;
        let storage = guard.as_ref()?;
        let seq = *storage.by_id.get(id)?;
        storage.events.get(seq as usize).cloned()
    }

    /// Newest first, bounded by `created_at` range and `limit`.
    pub async fn query(&self, since: Option<u64>, until: Option<u64>, limit: usize) -> Vec<NostrEvent> {
        let guard = self.storage.lock().await;
        let Some(storage) = guard.as_ref() else { return Vec::new() };
        let lo = since.unwrap_or(0);
        let hi = until.unwrap_or(u64::MAX);
        if lo > hi {
            return Vec::new();
        }
        storage
            .ordered
            .range((lo, String::new())..)
            .rev()
            .filter(|((created_at, _), _)| *created_at <= hi)
            .take(limit)
            .filter_map(|(_, seq)| storage.events.get(*seq as usize).cloned())
            .collect()
    }

    fn emit_replication(&self) {
        let length = self.length();
        self.sinks.emit(&TelemetryEvent::Replication {
            length,
            indexed: length,
            writer: lock(&self.writer).clone(),
            ts: now_ms(),
        });
    }
}

impl Drop for ReplicatedRelayHost {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.telemetry_task).take() {
            task.abort();
        }
    }
}

async fn replay_log(path: &Path) -> Result<Vec<NostrEvent>> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut out = Vec::new();
    let mut seen = std::collections::HashSet::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<NostrEvent>(&line) {
            Ok(ev) => {
                if seen.insert(ev.id.clone()) {
                    out.push(ev);
                }
            }
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "skipping corrupt log line"),
        }
    }
    Ok(out)
}
