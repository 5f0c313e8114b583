//! Dispatcher job and assignment records shared by the dispatcher and the
//! blind peer registry.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub relay_key: String,
    pub peer_id: Option<String>,
    /// Client connection that issued the REQ, when there is one.
    #[serde(default)]
    pub session: Option<u64>,
}

/// Subscription ids are only unique per connection, so jobs are tracked by
/// session plus id.
pub fn job_key(session: Option<u64>, job_id: &str) -> String {
    match session {
        Some(session) => format!("{session}/{job_id}"),
        None => job_id.to_string(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub relay_key: String,
    pub filters: Vec<Value>,
    pub peers: Vec<String>,
    pub requester: Requester,
}

impl Job {
    pub fn key(&self) -> String {
        job_key(self.requester.session, &self.id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Acknowledged,
    Failed,
    Completed,
}

impl AssignmentStatus {
    /// Status only moves forward; `Failed` and `Completed` are terminal.
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        matches!(
            (self, next),
            (Assigned, Acknowledged) | (Assigned, Failed) | (Assigned, Completed) | (Acknowledged, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AssignmentStatus::Failed | AssignmentStatus::Completed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub job_id: String,
    pub peer_id: String,
    pub relay_key: String,
    pub filters: Vec<Value>,
    pub requester: Requester,
    pub status: AssignmentStatus,
    pub assigned_at: u64,
    pub completed_at: Option<u64>,
}

impl Assignment {
    pub fn key(&self) -> String {
        job_key(self.requester.session, &self.job_id)
    }
}
