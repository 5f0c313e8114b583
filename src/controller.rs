//! Per-connection relay protocol handling.
//!
//! A `Session` is created for every client socket. Frames for one session run
//! one at a time through its message queue; different sessions proceed in
//! parallel. `EVENT` goes to the relay host, `REQ` goes to the dispatcher
//! (when enabled) and then to the upstream forwarding path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::dispatcher::{Decision, RelayDispatcher, ScheduleStatus};
use crate::job::{Job, Requester};
use crate::nostr::{frame_notice, frame_ok};
use crate::relay_host::{ApplyOutcome, ReplicatedRelayHost};
use crate::util::lock;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[async_trait]
pub trait RelayEventSink: Send + Sync {
    async fn apply_event(&self, raw: &Value) -> Result<ApplyOutcome>;
}

#[async_trait]
impl RelayEventSink for ReplicatedRelayHost {
    async fn apply_event(&self, raw: &Value) -> Result<ApplyOutcome> {
        ReplicatedRelayHost::apply_event(self, raw).await
    }
}

pub trait JobScheduler: Send + Sync {
    fn schedule(&self, job: &Job) -> Decision;
}

impl JobScheduler for RelayDispatcher {
    fn schedule(&self, job: &Job) -> Decision {
        RelayDispatcher::schedule(self, job)
    }
}

/// Upstream path for frames the gateway delegates to peer relays.
#[async_trait]
pub trait LegacyForwarder: Send + Sync {
    /// `peer` of `None` means every upstream the session is linked to.
    async fn forward(&self, session: &Session, peer: Option<&str>, frame: &str) -> Result<()>;

    async fn release(&self, _session: &Session) {}
}

/// FIFO turnstile; tokio's mutex grants the lock in request order.
#[derive(Default)]
pub struct MessageQueue {
    turn: tokio::sync::Mutex<()>,
}

impl MessageQueue {
    pub async fn enqueue<F, T>(&self, work: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _turn = self.turn.lock().await;
        work.await
    }
}

pub struct Session {
    pub id: u64,
    pub relay_key: String,
    pub peers: Vec<String>,
    pub client_pubkey: Option<String>,
    queue: MessageQueue,
    outbound: mpsc::UnboundedSender<String>,
    assigned: Mutex<Vec<String>>,
}

impl Session {
    pub fn new(
        relay_key: impl Into<String>,
        peers: Vec<String>,
        client_pubkey: Option<String>,
        outbound: mpsc::UnboundedSender<String>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            relay_key: relay_key.into(),
            peers,
            client_pubkey,
            queue: MessageQueue::default(),
            outbound,
            assigned: Mutex::new(Vec::new()),
        }
    }

    /// Queue a frame for the client. A closed socket drops it silently.
    pub fn send(&self, frame: String) {
        let _ = self.outbound.send(frame);
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<String> {
        self.outbound.clone()
    }

    pub fn assign_peer(&self, peer: &str) {
        let mut assigned = lock(&self.assigned);
        if !assigned.iter().any(|p| p == peer) {
            assigned.push(peer.to_string());
        }
    }

    pub fn assigned_peers(&self) -> Vec<String> {
        lock(&self.assigned).clone()
    }
}

pub struct ProtocolController {
    host: Arc<dyn RelayEventSink>,
    scheduler: Arc<dyn JobScheduler>,
    legacy: Arc<dyn LegacyForwarder>,
    dispatcher_enabled: bool,
}

impl ProtocolController {
    pub fn new(
        host: Arc<dyn RelayEventSink>,
        scheduler: Arc<dyn JobScheduler>,
        legacy: Arc<dyn LegacyForwarder>,
        dispatcher_enabled: bool,
    ) -> Self {
        Self {
            host,
            scheduler,
            legacy,
            dispatcher_enabled,
        }
    }

    /// Returns whether the frame was recognized. Unrecognized frames are
    /// dropped and never forwarded.
    pub async fn handle_message(&self, session: &Session, raw: &str) -> Result<bool> {
        session.queue.enqueue(self.dispatch(session, raw)).await
    }

    /// Connection teardown. Trust and registrations are left untouched.
    pub async fn close_session(&self, session: &Session) {
        self.legacy.release(session).await;
        tracing::debug!(session = session.id, relay = %session.relay_key, "session closed");
    }

    async fn dispatch(&self, session: &Session, raw: &str) -> Result<bool> {
        let Ok(Value::Array(frame)) = serde_json::from_str::<Value>(raw) else {
            return Ok(false);
        };
        match frame.first().and_then(Value::as_str) {
            Some("EVENT") if frame.len() >= 2 => {
                self.handle_event(session, &frame[1]).await?;
                Ok(true)
            }
            Some("REQ") if frame.len() >= 2 && frame[1].is_string() => {
                let sub_id = frame[1].as_str().unwrap_or_default();
                self.handle_req(session, sub_id, frame[2..].to_vec(), raw).await?;
                Ok(true)
            }
            _ => {
                tracing::debug!(session = session.id, "unrecognized frame dropped");
                Ok(false)
            }
        }
    }

    async fn handle_event(&self, session: &Session, event: &Value) -> Result<()> {
        let id = event.get("id").and_then(Value::as_str).map(str::to_string);
        let outcome = self.host.apply_event(event).await?;
        match (outcome, id) {
            (ApplyOutcome::Accepted { id }, _) => {
                tracing::debug!(session = session.id, id = %id, "event accepted");
                session.send(frame_ok(&id, true, ""));
            }
            (ApplyOutcome::Rejected { reason }, Some(id)) => {
                tracing::debug!(session = session.id, id = %id, reason = %reason, "event rejected");
                session.send(frame_ok(&id, false, &reason));
            }
            (ApplyOutcome::Rejected { reason }, None) => {
                session.send(frame_notice(&reason));
            }
        }
        Ok(())
    }

    async fn handle_req(&self, session: &Session, sub_id: &str, filters: Vec<Value>, raw: &str) -> Result<()> {
        if !self.dispatcher_enabled {
            return self.legacy.forward(session, None, raw).await;
        }

        let job = Job {
            id: sub_id.to_string(),
            relay_key: session.relay_key.clone(),
            filters,
            peers: session.peers.clone(),
            requester: Requester {
                relay_key: session.relay_key.clone(),
                peer_id: session.client_pubkey.clone(),
                session: Some(session.id),
            },
        };
        let decision = self.scheduler.schedule(&job);
        if decision.status != ScheduleStatus::Assigned {
            tracing::debug!(session = session.id, sub = %sub_id, "no peers available, using legacy path");
            return self.legacy.forward(session, None, raw).await;
        }

        for peer in &session.peers {
            session.assign_peer(peer);
        }
        for peer in session.assigned_peers() {
            self.legacy.forward(session, Some(&peer), raw).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{JobScheduler, LegacyForwarder, ProtocolController, RelayEventSink, Session};
    use crate::dispatcher::{Decision, DispatcherPolicy, RelayDispatcher, ScheduleStatus};
    use crate::job::AssignmentStatus;
    use crate::job::Job;
    use crate::nostr::signed_test_event;
    use crate::relay_host::ApplyOutcome;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct AcceptAll {
        active: AtomicUsize,
        max_active: AtomicUsize,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RelayEventSink for AcceptAll {
        async fn apply_event(&self, raw: &Value) -> Result<ApplyOutcome> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(match raw.get("id").and_then(Value::as_str) {
                Some(id) => ApplyOutcome::Accepted { id: id.to_string() },
                None => ApplyOutcome::Rejected {
                    reason: "invalid: bad event id".to_string(),
                },
            })
        }
    }

    struct FixedScheduler {
        calls: AtomicUsize,
        status: ScheduleStatus,
    }

    impl JobScheduler for FixedScheduler {
        fn schedule(&self, job: &Job) -> Decision {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Decision {
                status: self.status,
                assigned_peer: job.peers.first().cloned().filter(|_| self.status == ScheduleStatus::Assigned),
            }
        }
    }

    #[derive(Default)]
    struct RecordingForwarder {
        calls: Mutex<Vec<(Option<String>, String)>>,
    }

    #[async_trait]
    impl LegacyForwarder for RecordingForwarder {
        async fn forward(&self, _session: &Session, peer: Option<&str>, frame: &str) -> Result<()> {
            self.calls
                .lock()
                .expect("lock")
                .push((peer.map(str::to_string), frame.to_string()));
            Ok(())
        }
    }

    struct Harness {
        controller: ProtocolController,
        scheduler: Arc<FixedScheduler>,
        forwarder: Arc<RecordingForwarder>,
        session: Session,
        rx: mpsc::UnboundedReceiver<String>,
    }

    fn harness(enabled: bool, status: ScheduleStatus, sink: Arc<AcceptAll>) -> Harness {
        let scheduler = Arc::new(FixedScheduler {
            calls: AtomicUsize::new(0),
            status,
        });
        let forwarder = Arc::new(RecordingForwarder::default());
        let controller = ProtocolController::new(sink, scheduler.clone(), forwarder.clone(), enabled);
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new(
            "relay-1",
            vec!["peer-a".to_string(), "peer-b".to_string()],
            Some("client-pk".to_string()),
            tx,
        );
        Harness {
            controller,
            scheduler,
            forwarder,
            session,
            rx,
        }
    }

    #[tokio::test]
    async fn event_then_req_with_dispatcher_disabled() {
        let mut h = harness(false, ScheduleStatus::Assigned, Arc::new(AcceptAll::default()));
        let ev = signed_test_event(1, "hello");
        let frame = serde_json::json!(["EVENT", ev]).to_string();

        assert!(h.controller.handle_message(&h.session, &frame).await.expect("event"));
        let ok: Value = serde_json::from_str(&h.rx.recv().await.expect("ok frame")).expect("json");
        assert_eq!(ok, serde_json::json!(["OK", ev.id, true, ""]));

        let req = r#"["REQ","sub1",{"kinds":[1]}]"#;
        assert!(h.controller.handle_message(&h.session, req).await.expect("req"));
        let calls = h.forwarder.calls.lock().expect("lock").clone();
        assert_eq!(calls, vec![(None, req.to_string())]);
        assert_eq!(h.scheduler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn req_with_dispatcher_assigns_every_candidate() {
        let h = harness(true, ScheduleStatus::Assigned, Arc::new(AcceptAll::default()));
        let req = r#"["REQ","sub1",{"kinds":[1]}]"#;
        assert!(h.controller.handle_message(&h.session, req).await.expect("req"));

        assert_eq!(h.scheduler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.assigned_peers(), vec!["peer-a".to_string(), "peer-b".to_string()]);
        let peers: Vec<Option<String>> = h.forwarder.calls.lock().expect("lock").iter().map(|c| c.0.clone()).collect();
        assert_eq!(peers, vec![Some("peer-a".to_string()), Some("peer-b".to_string())]);
    }

    #[tokio::test]
    async fn req_without_available_peers_falls_back_once() {
        let h = harness(true, ScheduleStatus::NoPeersAvailable, Arc::new(AcceptAll::default()));
        assert!(h.controller.handle_message(&h.session, r#"["REQ","s",{}]"#).await.expect("req"));
        assert!(h.session.assigned_peers().is_empty());
        assert_eq!(h.forwarder.calls.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn unrecognized_frames_are_not_forwarded() {
        let h = harness(false, ScheduleStatus::Assigned, Arc::new(AcceptAll::default()));
        for raw in [r#"["CLOSE","sub1"]"#, r#"["COUNT","c",{}]"#, "not json", r#"{"EVENT":1}"#, r#"["REQ"]"#] {
            assert!(!h.controller.handle_message(&h.session, raw).await.expect("frame"));
        }
        assert!(h.forwarder.calls.lock().expect("lock").is_empty());
    }

    #[tokio::test]
    async fn rejected_event_is_still_handled() {
        let mut h = harness(false, ScheduleStatus::Assigned, Arc::new(AcceptAll::default()));
        assert!(h.controller.handle_message(&h.session, r#"["EVENT",{"kind":1}]"#).await.expect("event"));
        let notice: Value = serde_json::from_str(&h.rx.recv().await.expect("frame")).expect("json");
        assert_eq!(notice[0], "NOTICE");
    }

    #[tokio::test]
    async fn frames_from_one_session_never_overlap() {
        let sink = Arc::new(AcceptAll {
            delay: Some(Duration::from_millis(20)),
            ..AcceptAll::default()
        });
        let h = harness(false, ScheduleStatus::Assigned, sink.clone());
        let frames: Vec<String> = (0..4)
            .map(|i| serde_json::json!(["EVENT", signed_test_event(1, &format!("m{i}"))]).to_string())
            .collect();
        let runs = frames.iter().map(|f| h.controller.handle_message(&h.session, f));
        for handled in futures_util::future::join_all(runs).await {
            assert!(handled.expect("handled"));
        }
        assert_eq!(sink.max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reused_sub_id_across_sessions_keeps_both_jobs() {
        let dispatcher = Arc::new(RelayDispatcher::new(DispatcherPolicy::default()));
        let forwarder = Arc::new(RecordingForwarder::default());
        let controller = ProtocolController::new(
            Arc::new(AcceptAll::default()),
            dispatcher.clone(),
            forwarder.clone(),
            true,
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = Session::new("relay-1", vec!["peer-a".to_string()], Some("client-a".to_string()), tx.clone());
        let second = Session::new("relay-1", vec!["peer-a".to_string()], Some("client-b".to_string()), tx);

        let req = r#"["REQ","sub1",{"kinds":[1]}]"#;
        assert!(controller.handle_message(&first, req).await.expect("first req"));
        assert!(controller.handle_message(&second, req).await.expect("second req"));

        let live = dispatcher.assignments_snapshot();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|a| a.job_id == "sub1" && a.status == AssignmentStatus::Assigned));
        let mut owners: Vec<Option<u64>> = live.iter().map(|a| a.requester.session).collect();
        owners.sort();
        assert_eq!(owners, vec![Some(first.id), Some(second.id)]);
        assert_eq!(dispatcher.peer_metrics("peer-a").map(|m| m.in_flight_jobs), Some(2));
    }
}
