use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque process-unique job identifier, stable for the job's lifetime.
/// Formatted `H:<prefix>:<seq>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobHandle(pub String);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Identifies a client connection. Assigned by the transport layer; the
/// core never touches the socket itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client:{}", self.0)
    }
}

/// Identifies a worker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}

/// Dispatch priority. High preempts Normal preempts Low; FIFO within a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    High,
    Normal,
    Low,
}

pub const PRIORITY_TIERS: usize = 3;

impl Priority {
    /// Tier index, 0 = highest. Used to pick the pending ring.
    pub fn tier(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Queued,
    Running,
    Complete,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Complete => write!(f, "complete"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

/// A unit of work owned by the [`JobRegistry`](crate::broker::registry::JobRegistry).
///
/// All other tables (function table, worker sessions) refer to jobs by
/// handle only; this struct is the single source of truth for mutable
/// job state.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: JobHandle,
    pub function_name: String,
    /// Deduplication key scoped to `function_name`. Empty means no dedup.
    pub unique_key: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub state: JobState,
    /// Background jobs detach from their submitting client after the ack.
    pub is_background: bool,
    /// Clients currently interested in events for this handle.
    pub listeners: HashSet<ClientId>,
    pub assigned_worker: Option<WorkerId>,
    /// Worker-reported failures counted against the retry limit.
    /// Disconnects do not increment this.
    pub fail_count: u32,
    /// Last progress report (numerator, denominator) from the worker.
    pub progress: Option<(u32, u32)>,
    pub created_at: DateTime<Utc>,
    /// Jobs with a future `run_at` stay invisible to dispatch until due.
    pub run_at: Option<DateTime<Utc>>,
    /// Monotonic arrival number, the FIFO tiebreaker within a priority tier.
    pub seq: u64,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, JobState::Complete | JobState::Failed)
    }

    /// Whether the job should be visible to dispatch at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.run_at {
            Some(at) => at <= now,
            None => true,
        }
    }
}

/// Point-in-time answer to a client status query, shaped like the wire
/// protocol's status response: existence, liveness, and last progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusSnapshot {
    pub handle: JobHandle,
    pub known: bool,
    pub running: bool,
    pub numerator: u32,
    pub denominator: u32,
}
