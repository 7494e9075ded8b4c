//! Persistence Port: the contract the broker core requires from any
//! durable job storage backend.
//!
//! The core calls `add` when a job is created, `done` when it reaches a
//! terminal state, and `replay` once at startup to repopulate in-memory
//! state. Backends live outside the core; [`MemoryStore`] is the built-in
//! default (no durability across processes, but a faithful implementation
//! of the contract for tests and single-process use).

pub mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::job::{Job, JobHandle, Priority};

/// Backend failures carry only a message; the core maps them into
/// [`BrokerError::Persistence`](crate::error::BrokerError::Persistence).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct StoreError(pub String);

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The durable subset of a job. Transient fields (listeners, progress,
/// assigned worker) are never persisted; a replayed job always comes back
/// queued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub handle: JobHandle,
    pub function_name: String,
    pub unique_key: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub run_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn from_job(job: &Job) -> Self {
        Self {
            handle: job.handle.clone(),
            function_name: job.function_name.clone(),
            unique_key: job.unique_key.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            created_at: job.created_at,
            run_at: job.run_at,
        }
    }
}

/// Durable job storage contract.
///
/// Implementations must make `add` followed by `done` idempotent against a
/// crash between the two: replaying a record whose job already completed is
/// handled by the core (the job is simply re-queued and re-run), so
/// at-least-once is the delivery guarantee durable jobs get.
pub trait JobStore: Send {
    /// Persist a newly created job. For strict durability the core will not
    /// acknowledge a non-background submission until this returns Ok.
    fn add(&mut self, record: &JobRecord) -> StoreResult<()>;

    /// Force buffered writes to stable storage.
    fn flush(&mut self) -> StoreResult<()>;

    /// Remove a job from durable storage on terminal completion,
    /// failure, or cancel.
    fn done(&mut self, handle: &JobHandle) -> StoreResult<()>;

    /// Stream every durable, non-terminal job back to the core. Called once
    /// at startup, before the broker accepts connections.
    fn replay(&mut self, callback: &mut dyn FnMut(JobRecord)) -> StoreResult<()>;

    /// Whether a durable record exists for (function, unique). Lets the
    /// core short-circuit dedup checks against durable state for backends
    /// that do not keep everything resident. Default: unsupported.
    fn exists_by_unique(&mut self, _function_name: &str, _unique_key: &str) -> StoreResult<bool> {
        Ok(false)
    }
}
