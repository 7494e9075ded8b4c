use std::collections::{HashMap, HashSet};

use tokio::sync::oneshot;

use crate::broker::job::{JobHandle, WorkerId};
use crate::error::{BrokerError, Result};

/// What a worker receives when a job is handed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub handle: JobHandle,
    pub function_name: String,
    pub unique_key: String,
    pub payload: Vec<u8>,
}

/// Per-worker state. The core holds only the connection id; the socket
/// lives in the transport layer.
#[derive(Debug)]
pub struct WorkerSession {
    pub id: WorkerId,
    pub capabilities: HashSet<String>,
    /// At most one job at a time.
    pub current_job: Option<JobHandle>,
    /// Present while the worker is blocked in a grab call. Consumed on
    /// hand-off; dropped on timeout or disconnect.
    pub parked: Option<oneshot::Sender<Assignment>>,
}

impl WorkerSession {
    fn new(id: WorkerId) -> Self {
        Self {
            id,
            capabilities: HashSet::new(),
            current_job: None,
            parked: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.current_job.is_none()
    }
}

/// All live worker sessions, keyed by connection id.
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: HashMap<WorkerId, WorkerSession>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the session if this is the first registration. Idempotent.
    pub fn ensure(&mut self, worker: WorkerId) -> &mut WorkerSession {
        self.workers
            .entry(worker)
            .or_insert_with(|| WorkerSession::new(worker))
    }

    pub fn get(&self, worker: WorkerId) -> Result<&WorkerSession> {
        self.workers
            .get(&worker)
            .ok_or(BrokerError::WorkerNotFound(worker.0))
    }

    pub fn get_mut(&mut self, worker: WorkerId) -> Result<&mut WorkerSession> {
        self.workers
            .get_mut(&worker)
            .ok_or(BrokerError::WorkerNotFound(worker.0))
    }

    pub fn remove(&mut self, worker: WorkerId) -> Option<WorkerSession> {
        self.workers.remove(&worker)
    }

    /// Workers capable of `function`, counted for the admin surface.
    pub fn capable_count(&self, function: &str) -> usize {
        self.workers
            .values()
            .filter(|w| w.capabilities.contains(function))
            .count()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
