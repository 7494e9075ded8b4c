use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::broker::job::{
    ClientId, Job, JobHandle, JobState, JobStatusSnapshot, Priority, WorkerId,
};
use crate::error::{BrokerError, Result};

/// Outcome of a job creation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Created {
    /// A fresh job was allocated and inserted in `Queued` state.
    New(JobHandle),
    /// An active job with the same (function, unique key) already existed;
    /// the submission was merged onto it. Not an error.
    Coalesced(JobHandle),
}

impl Created {
    pub fn handle(&self) -> &JobHandle {
        match self {
            Created::New(h) | Created::Coalesced(h) => h,
        }
    }

    pub fn is_coalesced(&self) -> bool {
        matches!(self, Created::Coalesced(_))
    }
}

/// Sole owner of the canonical job records.
///
/// Indexed by handle and by (function, unique key). Every other table in
/// the broker stores handles and looks them up here, so there is exactly
/// one mutable copy of each job.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobHandle, Job>,
    /// (function_name, unique_key) -> handle, for submission coalescing.
    /// Only populated for jobs with a non-empty unique key; entries leave
    /// with the job.
    unique_index: HashMap<(String, String), JobHandle>,
    handle_prefix: String,
    next_handle: u64,
    next_seq: u64,
}

pub struct NewJob {
    pub function_name: String,
    pub unique_key: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub is_background: bool,
    pub run_at: Option<DateTime<Utc>>,
}

impl JobRegistry {
    pub fn new(handle_prefix: impl Into<String>) -> Self {
        Self {
            handle_prefix: handle_prefix.into(),
            next_handle: 1,
            next_seq: 1,
            ..Default::default()
        }
    }

    fn allocate_handle(&mut self) -> JobHandle {
        let handle = JobHandle(format!("H:{}:{}", self.handle_prefix, self.next_handle));
        self.next_handle += 1;
        handle
    }

    /// Create a job, or coalesce onto an active duplicate.
    ///
    /// If `unique_key` is non-empty and a non-terminal job already exists
    /// for (function, unique key), the existing handle is returned and
    /// `submitter` (if any) joins its listener set. Terminal jobs never
    /// coalesce; they have already left the registry.
    pub fn create(&mut self, spec: NewJob, submitter: Option<ClientId>) -> Created {
        if !spec.unique_key.is_empty() {
            let key = (spec.function_name.clone(), spec.unique_key.clone());
            if let Some(handle) = self.unique_index.get(&key) {
                let handle = handle.clone();
                if let Some(job) = self.jobs.get_mut(&handle) {
                    if let Some(client) = submitter {
                        job.listeners.insert(client);
                    }
                    tracing::debug!(
                        handle = %handle,
                        function = %spec.function_name,
                        "Duplicate submission coalesced"
                    );
                    return Created::Coalesced(handle);
                }
            }
        }

        let handle = self.allocate_handle();
        let seq = self.next_seq;
        self.next_seq += 1;

        let mut listeners = std::collections::HashSet::new();
        if let Some(client) = submitter {
            listeners.insert(client);
        }

        let job = Job {
            handle: handle.clone(),
            function_name: spec.function_name,
            unique_key: spec.unique_key,
            payload: spec.payload,
            priority: spec.priority,
            state: JobState::Queued,
            is_background: spec.is_background,
            listeners,
            assigned_worker: None,
            fail_count: 0,
            progress: None,
            created_at: Utc::now(),
            run_at: spec.run_at,
            seq,
        };

        if !job.unique_key.is_empty() {
            self.unique_index.insert(
                (job.function_name.clone(), job.unique_key.clone()),
                handle.clone(),
            );
        }
        self.jobs.insert(handle.clone(), job);
        Created::New(handle)
    }

    /// Re-insert a job replayed from durable storage, preserving its
    /// original handle. Replayed jobs always come back `Queued`; worker
    /// sessions do not survive a restart.
    pub fn restore(&mut self, record: crate::storage::JobRecord) -> JobHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        // Keep the handle counter ahead of any replayed handle so fresh
        // allocations never collide.
        if let Some(n) = record
            .handle
            .as_str()
            .rsplit(':')
            .next()
            .and_then(|s| s.parse::<u64>().ok())
        {
            if n >= self.next_handle {
                self.next_handle = n + 1;
            }
        }

        let job = Job {
            handle: record.handle.clone(),
            function_name: record.function_name,
            unique_key: record.unique_key,
            payload: record.payload,
            priority: record.priority,
            state: JobState::Queued,
            is_background: true,
            listeners: std::collections::HashSet::new(),
            assigned_worker: None,
            fail_count: 0,
            progress: None,
            created_at: record.created_at,
            run_at: record.run_at,
            seq,
        };

        if !job.unique_key.is_empty() {
            self.unique_index.insert(
                (job.function_name.clone(), job.unique_key.clone()),
                job.handle.clone(),
            );
        }
        let handle = job.handle.clone();
        self.jobs.insert(handle.clone(), job);
        handle
    }

    pub fn get(&self, handle: &JobHandle) -> Result<&Job> {
        self.jobs
            .get(handle)
            .ok_or_else(|| BrokerError::JobNotFound(handle.clone()))
    }

    pub fn get_mut(&mut self, handle: &JobHandle) -> Result<&mut Job> {
        self.jobs
            .get_mut(handle)
            .ok_or_else(|| BrokerError::JobNotFound(handle.clone()))
    }

    pub fn contains(&self, handle: &JobHandle) -> bool {
        self.jobs.contains_key(handle)
    }

    /// Live job for (function, unique key), if any.
    pub fn find_unique(&self, function_name: &str, unique_key: &str) -> Option<&JobHandle> {
        self.unique_index
            .get(&(function_name.to_string(), unique_key.to_string()))
    }

    /// Worker failure accounting. Returns the resulting state: `Queued`
    /// while the job has retries left, `Failed` once it runs out.
    pub fn report_failure(
        &mut self,
        handle: &JobHandle,
        worker: WorkerId,
        retry_limit: u32,
    ) -> Result<JobState> {
        let job = self.get_mut(handle)?;
        if job.state != JobState::Running || job.assigned_worker != Some(worker) {
            return Err(BrokerError::InvalidTransition {
                handle: handle.clone(),
                detail: format!("{} does not hold this {} job", worker, job.state),
            });
        }
        job.fail_count += 1;
        job.assigned_worker = None;
        job.progress = None;
        if job.fail_count <= retry_limit {
            job.state = JobState::Queued;
        } else {
            job.state = JobState::Failed;
        }
        Ok(job.state)
    }

    /// Queued -> Running, recording the assignee.
    pub fn mark_running(&mut self, handle: &JobHandle, worker: WorkerId) -> Result<()> {
        let job = self.get_mut(handle)?;
        if job.state != JobState::Queued {
            return Err(BrokerError::InvalidTransition {
                handle: handle.clone(),
                detail: format!("cannot assign a {} job", job.state),
            });
        }
        job.state = JobState::Running;
        job.assigned_worker = Some(worker);
        Ok(())
    }

    /// Running -> Complete. Only the worker holding the job may report.
    pub fn mark_complete(&mut self, handle: &JobHandle, worker: WorkerId) -> Result<()> {
        self.finish(handle, worker, JobState::Complete)
    }

    /// Running -> Failed. Only the worker holding the job may report.
    pub fn mark_failed(&mut self, handle: &JobHandle, worker: WorkerId) -> Result<()> {
        self.finish(handle, worker, JobState::Failed)
    }

    fn finish(&mut self, handle: &JobHandle, worker: WorkerId, state: JobState) -> Result<()> {
        let job = self.get_mut(handle)?;
        if job.state != JobState::Running || job.assigned_worker != Some(worker) {
            return Err(BrokerError::InvalidTransition {
                handle: handle.clone(),
                detail: format!("{} does not hold this {} job", worker, job.state),
            });
        }
        job.state = state;
        job.assigned_worker = None;
        Ok(())
    }

    /// Running -> Queued after a worker connection drop. Not a failure:
    /// `fail_count` is untouched.
    pub fn mark_requeued(&mut self, handle: &JobHandle) -> Result<()> {
        let job = self.get_mut(handle)?;
        job.state = JobState::Queued;
        job.assigned_worker = None;
        job.progress = None;
        Ok(())
    }

    /// Evict a job from the registry and the unique index.
    pub fn remove(&mut self, handle: &JobHandle) -> Result<Job> {
        let job = self
            .jobs
            .remove(handle)
            .ok_or_else(|| BrokerError::JobNotFound(handle.clone()))?;
        if !job.unique_key.is_empty() {
            self.unique_index
                .remove(&(job.function_name.clone(), job.unique_key.clone()));
        }
        Ok(job)
    }

    pub fn status_snapshot(&self, handle: &JobHandle) -> JobStatusSnapshot {
        match self.jobs.get(handle) {
            Some(job) => {
                let (numerator, denominator) = job.progress.unwrap_or((0, 0));
                JobStatusSnapshot {
                    handle: handle.clone(),
                    known: true,
                    running: job.state == JobState::Running,
                    numerator,
                    denominator,
                }
            }
            None => JobStatusSnapshot {
                handle: handle.clone(),
                known: false,
                running: false,
                numerator: 0,
                denominator: 0,
            },
        }
    }

    pub fn jobs_in_state(&self, state: JobState) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().filter(|j| j.state == state).collect();
        jobs.sort_by_key(|j| j.seq);
        jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(function: &str, unique: &str) -> NewJob {
        NewJob {
            function_name: function.to_string(),
            unique_key: unique.to_string(),
            payload: Vec::new(),
            priority: Priority::Normal,
            is_background: false,
            run_at: None,
        }
    }

    #[test]
    fn handles_are_sequential_and_prefixed() {
        let mut registry = JobRegistry::new("host1");
        let a = registry.create(spec("resize", ""), None);
        let b = registry.create(spec("resize", ""), None);
        assert_eq!(a.handle().as_str(), "H:host1:1");
        assert_eq!(b.handle().as_str(), "H:host1:2");
    }

    #[test]
    fn coalesces_on_active_unique_key() {
        let mut registry = JobRegistry::new("host1");
        let first = registry.create(spec("resize", "img-1"), Some(ClientId(1)));
        let second = registry.create(spec("resize", "img-1"), Some(ClientId(2)));

        assert!(!first.is_coalesced());
        assert!(second.is_coalesced());
        assert_eq!(first.handle(), second.handle());

        let job = registry.get(first.handle()).unwrap();
        assert_eq!(job.listeners.len(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn same_unique_key_different_function_does_not_coalesce() {
        let mut registry = JobRegistry::new("host1");
        let a = registry.create(spec("resize", "img-1"), None);
        let b = registry.create(spec("thumbnail", "img-1"), None);
        assert_ne!(a.handle(), b.handle());
    }

    #[test]
    fn removed_job_frees_unique_key() {
        let mut registry = JobRegistry::new("host1");
        let first = registry.create(spec("resize", "img-1"), None);
        registry.remove(first.handle()).unwrap();

        let second = registry.create(spec("resize", "img-1"), None);
        assert!(!second.is_coalesced());
        assert_ne!(first.handle(), second.handle());
    }

    #[test]
    fn complete_requires_the_assigned_worker() {
        let mut registry = JobRegistry::new("host1");
        let created = registry.create(spec("resize", ""), None);
        let handle = created.handle().clone();

        registry.mark_running(&handle, WorkerId(1)).unwrap();
        let err = registry.mark_complete(&handle, WorkerId(2)).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidTransition { .. }));

        registry.mark_complete(&handle, WorkerId(1)).unwrap();
        assert_eq!(registry.get(&handle).unwrap().state, JobState::Complete);
    }

    #[test]
    fn cannot_assign_a_running_job() {
        let mut registry = JobRegistry::new("host1");
        let created = registry.create(spec("resize", ""), None);
        let handle = created.handle().clone();

        registry.mark_running(&handle, WorkerId(1)).unwrap();
        let err = registry.mark_running(&handle, WorkerId(2)).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidTransition { .. }));
    }

    #[test]
    fn restore_keeps_handle_counter_ahead() {
        let mut registry = JobRegistry::new("host1");
        registry.restore(crate::storage::JobRecord {
            handle: JobHandle("H:host1:7".to_string()),
            function_name: "resize".to_string(),
            unique_key: String::new(),
            payload: Vec::new(),
            priority: Priority::Normal,
            created_at: Utc::now(),
            run_at: None,
        });

        let fresh = registry.create(spec("resize", ""), None);
        assert_eq!(fresh.handle().as_str(), "H:host1:8");
    }

    #[test]
    fn status_snapshot_for_unknown_handle() {
        let registry = JobRegistry::new("host1");
        let snap = registry.status_snapshot(&JobHandle("H:host1:99".to_string()));
        assert!(!snap.known);
        assert!(!snap.running);
    }
}
