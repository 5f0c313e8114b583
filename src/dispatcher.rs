//! Weighted REQ scheduling across candidate peers with per-peer circuit
//! breaking.
//!
//! All scheduling state sits behind one mutex so a job or peer entry is never
//! mutated by two callers at once. Events are emitted after the lock drops.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::DispatcherConfig;
use crate::job::{Assignment, AssignmentStatus, Job};
use crate::observer::{Observers, Subscription};
use crate::util::{lock, now_ms};

const MAX_RETAINED_TERMINAL: usize = 1024;

#[derive(Clone, Debug)]
pub struct DispatcherPolicy {
    pub max_concurrent_jobs_per_peer: u32,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_duration: Duration,
    pub in_flight_weight: f64,
    pub latency_weight: f64,
    pub failure_weight: f64,
    pub reassign_on_lag_blocks: u64,
}

impl From<&DispatcherConfig> for DispatcherPolicy {
    fn from(cfg: &DispatcherConfig) -> Self {
        Self {
            max_concurrent_jobs_per_peer: cfg.max_concurrent_jobs_per_peer.max(1),
            circuit_breaker_threshold: cfg.circuit_breaker_threshold.max(1),
            circuit_breaker_duration: Duration::from_millis(cfg.circuit_breaker_duration_ms),
            in_flight_weight: cfg.in_flight_weight,
            latency_weight: cfg.latency_weight,
            failure_weight: cfg.failure_weight,
            reassign_on_lag_blocks: cfg.reassign_on_lag_blocks,
        }
    }
}

impl Default for DispatcherPolicy {
    fn default() -> Self {
        Self::from(&DispatcherConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMetrics {
    pub peer_id: String,
    pub latency_ms: f64,
    pub in_flight_jobs: u32,
    pub failure_rate: f64,
    pub reported_at: u64,
}

/// Heartbeat payload. Every field overwrites what the dispatcher holds.
#[derive(Clone, Debug, Default)]
pub struct MetricsReport {
    pub latency_ms: f64,
    pub in_flight_jobs: u32,
    pub failure_rate: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleStatus {
    Assigned,
    NoPeersAvailable,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    pub status: ScheduleStatus,
    pub assigned_peer: Option<String>,
}

impl Decision {
    fn none() -> Self {
        Self {
            status: ScheduleStatus::NoPeersAvailable,
            assigned_peer: None,
        }
    }
}

/// `job_id` is the wire id; `job_key` is what the dispatcher tracks it by.
#[derive(Clone, Debug)]
pub enum DispatcherEvent {
    Assignment {
        job_id: String,
        job_key: String,
        peer_id: String,
        job: Job,
    },
    Acknowledge {
        job_id: String,
        job_key: String,
        peer_id: String,
        delivered_count: u64,
    },
    Failure {
        job_id: String,
        job_key: String,
        peer_id: String,
        error: String,
    },
}

struct PeerState {
    metrics: PeerMetrics,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    lag_blocks: u64,
    successes: u32,
    failures: u32,
}

impl PeerState {
    fn new(peer_id: &str) -> Self {
        Self {
            metrics: PeerMetrics {
                peer_id: peer_id.to_string(),
                latency_ms: 0.0,
                in_flight_jobs: 0,
                failure_rate: 0.0,
                reported_at: 0,
            },
            consecutive_failures: 0,
            open_until: None,
            lag_blocks: 0,
            successes: 0,
            failures: 0,
        }
    }

    /// Closes an expired breaker as a side effect.
    fn circuit_open(&mut self, now: Instant) -> bool {
        match self.open_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.open_until = None;
                self.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    fn record_outcome(&mut self, ok: bool) {
        if ok {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let total = self.successes + self.failures;
        self.metrics.failure_rate = f64::from(self.failures) / f64::from(total);
    }

    fn release_slot(&mut self) {
        self.metrics.in_flight_jobs = self.metrics.in_flight_jobs.saturating_sub(1);
    }
}

#[derive(Default)]
struct State {
    peers: HashMap<String, PeerState>,
    assignments: HashMap<String, Assignment>,
    terminal: VecDeque<String>,
}

impl State {
    fn peer(&mut self, peer_id: &str) -> &mut PeerState {
        self.peers
            .entry(peer_id.to_string())
            .or_insert_with(|| PeerState::new(peer_id))
    }

    fn retire(&mut self, job_key: &str) {
        self.terminal.push_back(job_key.to_string());
        while self.terminal.len() > MAX_RETAINED_TERMINAL {
            if let Some(old) = self.terminal.pop_front() {
                if self.assignments.get(&old).is_some_and(|a| a.status.is_terminal()) {
                    self.assignments.remove(&old);
                }
            }
        }
    }
}

pub struct RelayDispatcher {
    policy: DispatcherPolicy,
    state: Mutex<State>,
    listeners: Observers<DispatcherEvent>,
}

impl RelayDispatcher {
    pub fn new(policy: DispatcherPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(State::default()),
            listeners: Observers::new(),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&DispatcherEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    fn cost(&self, m: &PeerMetrics) -> f64 {
        self.policy.in_flight_weight * f64::from(m.in_flight_jobs)
            + self.policy.latency_weight * m.latency_ms
            + self.policy.failure_weight * m.failure_rate
    }

    pub fn schedule(&self, job: &Job) -> Decision {
        let now = Instant::now();
        let mut state = lock(&self.state);

        let mut best: Option<(&str, f64)> = None;
        for peer_id in &job.peers {
            let cost = {
                let peer = state.peer(peer_id);
                if peer.circuit_open(now)
                    || peer.metrics.in_flight_jobs >= self.policy.max_concurrent_jobs_per_peer
                    || peer.lag_blocks > self.policy.reassign_on_lag_blocks
                {
                    continue;
                }
                self.cost(&peer.metrics)
            };
            if best.map_or(true, |(_, c)| cost < c) {
                best = Some((peer_id.as_str(), cost));
            }
        }
        let Some((peer_id, cost)) = best else {
            tracing::debug!(job = %job.id, candidates = job.peers.len(), "no peers available");
            return Decision::none();
        };
        let peer_id = peer_id.to_string();
        let job_key = job.key();

        if let Some(prior) = state.assignments.remove(&job_key) {
            if !prior.status.is_terminal() {
                state.peer(&prior.peer_id).release_slot();
                tracing::debug!(job = %job.id, peer = %prior.peer_id, "superseding live assignment");
            }
        }
        state.peer(&peer_id).metrics.in_flight_jobs += 1;
        state.assignments.insert(
            job_key.clone(),
            Assignment {
                job_id: job.id.clone(),
                peer_id: peer_id.clone(),
                relay_key: job.relay_key.clone(),
                filters: job.filters.clone(),
                requester: job.requester.clone(),
                status: AssignmentStatus::Assigned,
                assigned_at: now_ms(),
                completed_at: None,
            },
        );
        drop(state);

        tracing::debug!(job = %job.id, peer = %peer_id, cost, "job assigned");
        self.listeners.emit(&DispatcherEvent::Assignment {
            job_id: job.id.clone(),
            job_key,
            peer_id: peer_id.clone(),
            job: job.clone(),
        });
        Decision {
            status: ScheduleStatus::Assigned,
            assigned_peer: Some(peer_id),
        }
    }

    /// Takes the key from `Job::key`. Returns false when the job is unknown
    /// or already terminal.
    pub fn acknowledge(&self, job_key: &str, delivered_count: u64) -> bool {
        let mut state = lock(&self.state);
        let (job_id, peer_id) = match state.assignments.get_mut(job_key) {
            Some(a) if a.status.can_transition_to(AssignmentStatus::Acknowledged) => {
                a.status = AssignmentStatus::Completed;
                a.completed_at = Some(now_ms());
                (a.job_id.clone(), a.peer_id.clone())
            }
            _ => return false,
        };
        let peer = state.peer(&peer_id);
        peer.release_slot();
        peer.consecutive_failures = 0;
        peer.open_until = None;
        peer.record_outcome(true);
        state.retire(job_key);
        drop(state);

        self.listeners.emit(&DispatcherEvent::Acknowledge {
            job_id,
            job_key: job_key.to_string(),
            peer_id,
            delivered_count,
        });
        true
    }

    pub fn fail(&self, job_key: &str, error: &str) -> bool {
        let now = Instant::now();
        let mut state = lock(&self.state);
        let (job_id, peer_id) = match state.assignments.get_mut(job_key) {
            Some(a) if a.status.can_transition_to(AssignmentStatus::Failed) => {
                a.status = AssignmentStatus::Failed;
                a.completed_at = Some(now_ms());
                (a.job_id.clone(), a.peer_id.clone())
            }
            _ => return false,
        };
        let threshold = self.policy.circuit_breaker_threshold;
        let duration = self.policy.circuit_breaker_duration;
        let peer = state.peer(&peer_id);
        peer.release_slot();
        peer.record_outcome(false);
        // An elapsed window has to be closed before this failure is counted.
        let already_open = peer.circuit_open(now);
        peer.consecutive_failures += 1;
        if peer.consecutive_failures >= threshold && !already_open {
            peer.open_until = Some(now + duration);
            tracing::warn!(peer = %peer_id, failures = peer.consecutive_failures, "circuit opened");
        }
        state.retire(job_key);
        drop(state);

        self.listeners.emit(&DispatcherEvent::Failure {
            job_id,
            job_key: job_key.to_string(),
            peer_id,
            error: error.to_string(),
        });
        true
    }

    /// Heartbeat from a peer. Resets the locally observed failure rate.
    pub fn update_peer_metrics(&self, peer_id: &str, report: MetricsReport) {
        let mut state = lock(&self.state);
        let peer = state.peer(peer_id);
        peer.metrics.latency_ms = report.latency_ms;
        peer.metrics.in_flight_jobs = report.in_flight_jobs;
        peer.metrics.failure_rate = report.failure_rate;
        peer.metrics.reported_at = now_ms();
        peer.successes = 0;
        peer.failures = 0;
    }

    pub fn report_peer_lag(&self, peer_id: &str, lag_blocks: u64) {
        lock(&self.state).peer(peer_id).lag_blocks = lag_blocks;
    }

    pub fn peer_metrics(&self, peer_id: &str) -> Option<PeerMetrics> {
        lock(&self.state).peers.get(peer_id).map(|p| p.metrics.clone())
    }

    pub fn assignment(&self, job_key: &str) -> Option<Assignment> {
        lock(&self.state).assignments.get(job_key).cloned()
    }

    pub fn assignments_snapshot(&self) -> Vec<Assignment> {
        let mut out: Vec<Assignment> = lock(&self.state).assignments.values().cloned().collect();
        out.sort_by(|a, b| a.assigned_at.cmp(&b.assigned_at).then_with(|| a.job_id.cmp(&b.job_id)));
        out
    }
}
