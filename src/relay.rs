//! Upstream links from client sessions to peer relays.
//!
//! Each session gets at most one link per peer, opened lazily on the first
//! forwarded frame and torn down with the session. Frames coming back from a
//! peer are relayed to the client unchanged; `EOSE`/`CLOSED` and connection
//! loss are reported to the dispatcher for the job the peer was assigned.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::controller::{LegacyForwarder, Session};
use crate::dispatcher::RelayDispatcher;
use crate::job::job_key;
use crate::registration_store::RegistrationStore;
use crate::util::lock;

const RECONNECT_DELAY: Duration = Duration::from_secs(3);

pub struct LegacyRelayForwarder {
    store: Arc<dyn RegistrationStore>,
    dispatcher: Option<Arc<RelayDispatcher>>,
    links: Mutex<HashMap<u64, HashMap<String, PeerLink>>>,
}

impl LegacyRelayForwarder {
    pub fn new(store: Arc<dyn RegistrationStore>, dispatcher: Option<Arc<RelayDispatcher>>) -> Self {
        Self {
            store,
            dispatcher,
            links: Mutex::new(HashMap::new()),
        }
    }

    pub fn link_count(&self, session_id: u64) -> usize {
        lock(&self.links).get(&session_id).map_or(0, HashMap::len)
    }

    fn send_to(&self, session: &Session, peer: &str, frame: &str) {
        let mut links = lock(&self.links);
        let per_session = links.entry(session.id).or_default();
        if let Some(link) = per_session.get(peer) {
            link.send(frame);
            return;
        }
        let Some(url) = self.store.get_peer(peer).and_then(|p| p.endpoint) else {
            tracing::debug!(peer = %peer, session = session.id, "no upstream endpoint for peer");
            return;
        };
        let book = JobBook::new(session.id, peer.to_string(), self.dispatcher.clone());
        let link = PeerLink::spawn(url, book, session.outbound());
        link.send(frame);
        per_session.insert(peer.to_string(), link);
    }
}

#[async_trait]
impl LegacyForwarder for LegacyRelayForwarder {
    async fn forward(&self, session: &Session, peer: Option<&str>, frame: &str) -> Result<()> {
        match peer {
            Some(peer) => self.send_to(session, peer, frame),
            None => {
                for peer in &session.peers {
                    self.send_to(session, peer, frame);
                }
            }
        }
        Ok(())
    }

    async fn release(&self, session: &Session) {
        let dropped = lock(&self.links).remove(&session.id);
        if let Some(links) = dropped {
            tracing::debug!(session = session.id, links = links.len(), "upstream links released");
        }
    }
}

struct PeerLink {
    tx: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

impl PeerLink {
    fn send(&self, frame: &str) {
        let _ = self.tx.send(frame.to_string());
    }

    fn spawn(url: String, mut book: JobBook, client: mpsc::UnboundedSender<String>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let peer = book.peer.clone();
        let task = tokio::spawn(async move {
            loop {
                match connect_async(url.as_str()).await {
                    Ok((ws, _)) => {
                        tracing::info!(relay = %url, peer = %peer, "upstream connected");
                        let (mut write, mut read) = ws.split();

                        let mut resend_failed = false;
                        for frame in book.active_frames() {
                            if let Err(err) = write.send(Message::Text(frame)).await {
                                tracing::warn!(relay = %url, error = %err, "upstream resend failed");
                                resend_failed = true;
                                break;
                            }
                        }

                        while !resend_failed {
                            tokio::select! {
                                out = rx.recv() => {
                                    let Some(out) = out else { return };
                                    book.outgoing(&out);
                                    if let Err(err) = write.send(Message::Text(out)).await {
                                        tracing::warn!(relay = %url, error = %err, "upstream send failed");
                                        break;
                                    }
                                }
                                msg = read.next() => {
                                    match msg {
                                        Some(Ok(Message::Text(txt))) => {
                                            tracing::debug!(relay = %url, frame = %txt, "upstream rx");
                                            book.incoming(&txt);
                                            if client.send(txt).is_err() {
                                                return;
                                            }
                                        }
                                        Some(Ok(_)) => {}
                                        Some(Err(err)) => {
                                            tracing::warn!(relay = %url, error = %err, "upstream read failed");
                                            break;
                                        }
                                        None => break,
                                    }
                                }
                            }
                        }
                        book.fail_pending("upstream disconnected");
                    }
                    Err(err) => {
                        tracing::warn!(relay = %url, error = %err, "upstream connect failed");
                        while let Ok(out) = rx.try_recv() {
                            book.outgoing(&out);
                        }
                        book.fail_pending("upstream unreachable");
                    }
                }
                if client.is_closed() {
                    return;
                }
                sleep(RECONNECT_DELAY).await;
            }
        });
        Self { tx, task }
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Subscription bookkeeping for one upstream link. Subscription ids are
/// resolved to dispatcher jobs through the owning session.
struct JobBook {
    session: u64,
    peer: String,
    dispatcher: Option<Arc<RelayDispatcher>>,
    active: HashMap<String, String>,
    pending: HashSet<String>,
    delivered: HashMap<String, u64>,
}

impl JobBook {
    fn new(session: u64, peer: String, dispatcher: Option<Arc<RelayDispatcher>>) -> Self {
        Self {
            session,
            peer,
            dispatcher,
            active: HashMap::new(),
            pending: HashSet::new(),
            delivered: HashMap::new(),
        }
    }

    fn active_frames(&self) -> Vec<String> {
        self.active.values().cloned().collect()
    }

    fn outgoing(&mut self, frame: &str) {
        let Some((kind, sub)) = frame_head(frame) else { return };
        if kind == "REQ" {
            self.active.insert(sub.clone(), frame.to_string());
            self.pending.insert(sub.clone());
            self.delivered.insert(sub, 0);
        }
    }

    fn incoming(&mut self, frame: &str) {
        let Some((kind, sub)) = frame_head(frame) else { return };
        match kind.as_str() {
            "EVENT" => *self.delivered.entry(sub).or_default() += 1,
            "EOSE" => {
                if self.pending.remove(&sub) {
                    let count = self.delivered.get(&sub).copied().unwrap_or_default();
                    self.with_owned_job(&sub, |d, key| {
                        d.acknowledge(key, count);
                    });
                }
            }
            "CLOSED" => {
                self.active.remove(&sub);
                if self.pending.remove(&sub) {
                    let reason = serde_json::from_str::<Value>(frame)
                        .ok()
                        .and_then(|v| v.get(2).and_then(Value::as_str).map(str::to_string))
                        .unwrap_or_else(|| "closed by peer".to_string());
                    self.with_owned_job(&sub, |d, key| {
                        d.fail(key, &reason);
                    });
                }
            }
            _ => {}
        }
    }

    fn fail_pending(&mut self, reason: &str) {
        for sub in std::mem::take(&mut self.pending) {
            self.with_owned_job(&sub, |d, key| {
                d.fail(key, reason);
            });
        }
    }

    /// Only the peer the dispatcher picked reports outcomes for a job.
    fn with_owned_job(&self, sub: &str, f: impl FnOnce(&RelayDispatcher, &str)) {
        if let Some(d) = self.dispatcher.as_deref() {
            let key = job_key(Some(self.session), sub);
            if d.assignment(&key).is_some_and(|a| a.peer_id == self.peer) {
                f(d, &key);
            }
        }
    }
}

fn frame_head(frame: &str) -> Option<(String, String)> {
    let value: Value = serde_json::from_str(frame).ok()?;
    let kind = value.get(0)?.as_str()?;
    let sub = value.get(1)?.as_str()?;
    Some((kind.to_string(), sub.to_string()))
}
