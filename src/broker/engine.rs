use std::cmp::Reverse;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};

use crate::broker::events::{JobEvent, NotificationRouter};
use crate::broker::functions::FunctionTable;
use crate::broker::job::{
    ClientId, JobHandle, JobState, JobStatusSnapshot, Priority, WorkerId,
};
use crate::broker::registry::{Created, JobRegistry, NewJob};
use crate::broker::workers::{Assignment, WorkerTable};
use crate::config::{BrokerConfig, Durability};
use crate::error::{BrokerError, Result};
use crate::storage::{JobRecord, JobStore};

/// A decoded job submission, as handed over by the transport layer.
#[derive(Debug, Clone)]
pub struct Submission {
    pub function_name: String,
    pub unique_key: String,
    pub payload: Vec<u8>,
    pub priority: Priority,
    pub background: bool,
    pub run_at: Option<DateTime<Utc>>,
}

impl Submission {
    pub fn new(function_name: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            function_name: function_name.into(),
            unique_key: String::new(),
            payload: payload.into(),
            priority: Priority::Normal,
            background: false,
            run_at: None,
        }
    }

    pub fn with_unique(mut self, unique_key: impl Into<String>) -> Self {
        self.unique_key = unique_key.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// One row of the admin `status` surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionStats {
    pub name: String,
    pub queued: usize,
    pub running: usize,
    pub workers: usize,
}

/// Admin job listing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSummary {
    pub handle: JobHandle,
    pub function_name: String,
    pub state: JobState,
    pub priority: Priority,
}

/// The dispatch engine: single owner of all broker state.
///
/// Every entry point is a complete critical section; the engine is driven
/// from one task (see [`Broker`](crate::server::Broker)), so read-then-write
/// sequences like dedup-check-then-insert or dequeue-then-assign are atomic
/// with respect to each other by construction.
pub struct Engine {
    config: BrokerConfig,
    registry: JobRegistry,
    functions: FunctionTable,
    workers: WorkerTable,
    router: NotificationRouter,
    store: Box<dyn JobStore>,
    /// Jobs whose `run_at` has not arrived, ordered by due time. Invisible
    /// to dispatch until `sweep` moves them into their pending tier.
    scheduled: BinaryHeap<Reverse<(DateTime<Utc>, u64, JobHandle)>>,
}

impl Engine {
    /// Build the engine and replay durable jobs from the backend.
    ///
    /// Replayed jobs re-enter the registry as `Queued` (previously running
    /// jobs included: worker sessions did not survive the restart) and
    /// land in their pending tier or, if scheduled in the future, the
    /// due-time heap.
    pub fn new(config: BrokerConfig, mut store: Box<dyn JobStore>) -> Result<Self> {
        let mut records = Vec::new();
        store
            .replay(&mut |record| records.push(record))
            .map_err(|e| BrokerError::Persistence(e.to_string()))?;

        let mut engine = Self {
            registry: JobRegistry::new(config.handle_prefix.clone()),
            functions: FunctionTable::new(),
            workers: WorkerTable::new(),
            router: NotificationRouter::new(),
            store,
            scheduled: BinaryHeap::new(),
            config,
        };

        let now = Utc::now();
        let replayed = records.len();
        for record in records {
            let run_at = record.run_at;
            let function = record.function_name.clone();
            let priority = record.priority;
            let handle = engine.registry.restore(record);
            engine.functions.ensure(&function);
            match run_at {
                Some(at) if at > now => {
                    let seq = engine.registry.get(&handle)?.seq;
                    engine.scheduled.push(Reverse((at, seq, handle)));
                }
                _ => engine.functions.enqueue(&function, handle, priority),
            }
        }
        if replayed > 0 {
            tracing::info!(jobs = replayed, "Replayed durable jobs from backend");
        }
        Ok(engine)
    }

    /// Register a client connection and hand back its event stream.
    pub fn attach_client(&mut self, client: ClientId) -> mpsc::Receiver<JobEvent> {
        let (tx, rx) = mpsc::channel(self.config.event_channel_capacity);
        self.router.attach(client, tx);
        rx
    }

    /// Submit a job. Returns the handle, marking whether the submission
    /// coalesced onto an existing job.
    pub fn submit_job(&mut self, client: Option<ClientId>, sub: Submission) -> Result<Created> {
        // Listener registration is skipped for background submissions:
        // they detach after the ack.
        let listener = if sub.background { None } else { client };

        let coalesces = !sub.unique_key.is_empty()
            && self
                .registry
                .find_unique(&sub.function_name, &sub.unique_key)
                .is_some();

        if !coalesces {
            if let Some(max) = self.config.max_pending_per_function {
                let depth = self
                    .functions
                    .get(&sub.function_name)
                    .map_or(0, |f| f.depth());
                if depth >= max {
                    return Err(BrokerError::QueueFull(sub.function_name));
                }
            }

            // Dedup against durable state the backend still holds but we
            // never replayed. There is no live job to coalesce onto.
            if !sub.unique_key.is_empty() {
                let durable = self
                    .store
                    .exists_by_unique(&sub.function_name, &sub.unique_key)
                    .map_err(|e| BrokerError::Persistence(e.to_string()))?;
                if durable {
                    return Err(BrokerError::DuplicateDurable {
                        function: sub.function_name,
                        unique: sub.unique_key,
                    });
                }
            }
        }

        let background = sub.background;
        let run_at = sub.run_at;
        let function_name = sub.function_name.clone();
        let priority = sub.priority;

        let created = self.registry.create(
            NewJob {
                function_name: sub.function_name,
                unique_key: sub.unique_key,
                payload: sub.payload,
                priority: sub.priority,
                is_background: sub.background,
                run_at: sub.run_at,
            },
            listener,
        );

        if let Some(client) = listener {
            self.router.register_interest(client, created.handle());
        }
        if created.is_coalesced() {
            return Ok(created);
        }

        let handle = created.handle().clone();
        tracing::info!(
            handle = %handle,
            function = %function_name,
            priority = %priority,
            background,
            "Job created"
        );

        let record = JobRecord::from_job(self.registry.get(&handle)?);

        match run_at {
            Some(at) if at > Utc::now() => {
                let seq = self.registry.get(&handle)?.seq;
                self.functions.ensure(&function_name);
                self.scheduled.push(Reverse((at, seq, handle.clone())));
            }
            _ => self.enqueue_and_dispatch(&function_name, handle.clone(), priority),
        }

        // Durability before ack. On failure the job stays queued in memory
        // either way: the in-memory state is the source of truth until the
        // next replay (the submitter just hears about the weaker guarantee).
        if let Err(err) = self.store.add(&record) {
            match (self.config.durability, background) {
                (Durability::Strict, false) => {
                    return Err(BrokerError::Persistence(err.to_string()));
                }
                _ => {
                    tracing::warn!(handle = %handle, error = %err, "Backend add failed");
                }
            }
        }

        Ok(created)
    }

    fn enqueue_and_dispatch(&mut self, function: &str, handle: JobHandle, priority: Priority) {
        self.functions.enqueue(function, handle, priority);
        self.dispatch_function(function);
    }

    /// Hand pending jobs to parked workers until one side runs dry.
    /// First-registered waiting worker wins; stale ring entries (worker
    /// gone, busy, or responder dead) are discarded along the way.
    fn dispatch_function(&mut self, function: &str) {
        loop {
            let has_job = self
                .functions
                .get(function)
                .and_then(|f| f.peek_best())
                .is_some();
            if !has_job {
                return;
            }
            let Some(worker) = self.functions.pop_waiting(function) else {
                return;
            };

            let ready = self
                .workers
                .get(worker)
                .map(|s| s.is_idle() && s.parked.is_some())
                .unwrap_or(false);
            if !ready {
                continue;
            }

            let Some(handle) = self.functions.pop_best(function) else {
                return;
            };
            match self.handoff(handle, worker) {
                Ok(()) => self.functions.unpark_worker(worker),
                // Responder died under us (grab timeout raced): job went
                // back to the head, try the next parked worker.
                Err(()) => continue,
            }
        }
    }

    /// Deliver a job to a parked worker. On a dead responder the job is
    /// restored to the head of its tier and `Err(())` is returned.
    fn handoff(&mut self, handle: JobHandle, worker: WorkerId) -> std::result::Result<(), ()> {
        let assignment = match self.build_assignment(&handle) {
            Ok(a) => a,
            Err(_) => {
                self.requeue_head(&handle);
                return Err(());
            }
        };
        if self.registry.mark_running(&handle, worker).is_err() {
            self.requeue_head(&handle);
            return Err(());
        }

        let session = match self.workers.get_mut(worker) {
            Ok(s) => s,
            Err(_) => {
                let _ = self.registry.mark_requeued(&handle);
                self.requeue_head(&handle);
                return Err(());
            }
        };
        session.current_job = Some(handle.clone());
        let responder = session.parked.take();

        match responder {
            Some(tx) => match tx.send(assignment) {
                Ok(()) => {
                    tracing::info!(handle = %handle, worker = %worker, "Job dispatched");
                    Ok(())
                }
                Err(_) => {
                    // Receiver dropped: the worker gave up on this grab.
                    if let Ok(session) = self.workers.get_mut(worker) {
                        session.current_job = None;
                    }
                    let _ = self.registry.mark_requeued(&handle);
                    self.requeue_head(&handle);
                    Err(())
                }
            },
            None => {
                if let Ok(session) = self.workers.get_mut(worker) {
                    session.current_job = None;
                }
                let _ = self.registry.mark_requeued(&handle);
                self.requeue_head(&handle);
                Err(())
            }
        }
    }

    fn build_assignment(&self, handle: &JobHandle) -> Result<Assignment> {
        let job = self.registry.get(handle)?;
        Ok(Assignment {
            handle: job.handle.clone(),
            function_name: job.function_name.clone(),
            unique_key: job.unique_key.clone(),
            payload: job.payload.clone(),
        })
    }

    fn requeue_head(&mut self, handle: &JobHandle) {
        if let Ok(job) = self.registry.get(handle) {
            let (function, priority, handle) =
                (job.function_name.clone(), job.priority, job.handle.clone());
            self.functions.requeue_front(&function, handle, priority);
        }
    }

    /// Declare a worker capable of a function. Idempotent; creates both
    /// the session and the function entry as needed.
    pub fn worker_register(&mut self, worker: WorkerId, function: &str) {
        self.workers.ensure(worker).capabilities.insert(function.to_string());
        self.functions.ensure(function);
        tracing::debug!(worker = %worker, function, "Capability registered");
    }

    /// Withdraw one capability (the protocol's CAN'T_DO).
    pub fn worker_unregister(&mut self, worker: WorkerId, function: &str) -> Result<()> {
        let session = self.workers.get_mut(worker)?;
        if !session.capabilities.remove(function) {
            return Err(BrokerError::FunctionNotFound(function.to_string()));
        }
        // A parked worker no longer waits on this function.
        self.functions_remove_waiting(worker, function);
        Ok(())
    }

    fn functions_remove_waiting(&mut self, worker: WorkerId, function: &str) {
        // Narrow unpark: only this function's ring.
        let mut survivors = Vec::new();
        while let Some(w) = self.functions.pop_waiting(function) {
            if w != worker {
                survivors.push(w);
            }
        }
        for w in survivors {
            self.functions.park_worker(function, w);
        }
    }

    /// A worker asks for work. If a job for any of its capabilities is
    /// pending, the best one (priority-major, oldest-minor across all its
    /// functions) is assigned and returned. Otherwise, when `park` is
    /// given, the worker is left waiting on all its functions and will be
    /// handed the next matching job through the responder; the check and
    /// the parking are one atomic step, so no job can slip between them.
    pub fn grab_job(
        &mut self,
        worker: WorkerId,
        park: Option<oneshot::Sender<Assignment>>,
    ) -> Result<Option<Assignment>> {
        let session = self.workers.get(worker)?;
        if let Some(current) = &session.current_job {
            return Err(BrokerError::InvalidTransition {
                handle: current.clone(),
                detail: format!("{} already holds a job", worker),
            });
        }

        // Best pending job across this worker's capabilities.
        let mut best: Option<(usize, u64, String)> = None;
        for function in session.capabilities.iter() {
            let Some(handle) = self.functions.get(function).and_then(|f| f.peek_best()) else {
                continue;
            };
            let job = self.registry.get(handle)?;
            let key = (job.priority.tier(), job.seq);
            if best
                .as_ref()
                .map_or(true, |(tier, seq, _)| key < (*tier, *seq))
            {
                best = Some((key.0, key.1, function.clone()));
            }
        }

        if let Some((_, _, function)) = best {
            let Some(handle) = self.functions.pop_best(&function) else {
                return Ok(None);
            };
            let assignment = self.build_assignment(&handle)?;
            self.registry.mark_running(&handle, worker)?;
            self.workers.get_mut(worker)?.current_job = Some(handle.clone());
            tracing::info!(handle = %handle, worker = %worker, "Job grabbed");
            return Ok(Some(assignment));
        }

        if let Some(responder) = park {
            let capabilities: Vec<String> = self
                .workers
                .get(worker)?
                .capabilities
                .iter()
                .cloned()
                .collect();
            self.workers.get_mut(worker)?.parked = Some(responder);
            for function in capabilities {
                self.functions.park_worker(&function, worker);
            }
        }
        Ok(None)
    }

    /// Withdraw a parked grab (timeout or caller gone). If a hand-off
    /// raced with the timeout and the worker never saw the assignment,
    /// the job goes back to the head of its tier.
    pub fn cancel_grab(&mut self, worker: WorkerId) {
        self.functions.unpark_worker(worker);
        let Ok(session) = self.workers.get_mut(worker) else {
            return;
        };
        session.parked = None;
        if let Some(handle) = session.current_job.take() {
            tracing::debug!(handle = %handle, worker = %worker, "Grab cancelled after hand-off, re-queueing");
            let _ = self.registry.mark_requeued(&handle);
            self.requeue_head(&handle);
            if let Ok(job) = self.registry.get(&handle) {
                let function = job.function_name.clone();
                self.dispatch_function(&function);
            }
        }
    }

    /// Guard shared by every worker report: the reporting worker must hold
    /// the job and the job must be running.
    fn held_running_job(&self, worker: WorkerId, handle: &JobHandle) -> Result<&crate::broker::job::Job> {
        let job = self.registry.get(handle)?;
        if job.state != JobState::Running || job.assigned_worker != Some(worker) {
            return Err(BrokerError::InvalidTransition {
                handle: handle.clone(),
                detail: format!("{} does not hold this {} job", worker, job.state),
            });
        }
        Ok(job)
    }

    /// WORK_STATUS: progress report, forwarded to listeners, recorded for
    /// status queries. No state change.
    pub fn status_update(
        &mut self,
        worker: WorkerId,
        handle: &JobHandle,
        numerator: u32,
        denominator: u32,
    ) -> Result<()> {
        self.held_running_job(worker, handle)?;
        let job = self.registry.get_mut(handle)?;
        job.progress = Some((numerator, denominator));
        let listeners: Vec<ClientId> = job.listeners.iter().copied().collect();
        self.router.notify(
            listeners.iter(),
            JobEvent::Status {
                handle: handle.clone(),
                numerator,
                denominator,
            },
        );
        Ok(())
    }

    /// WORK_DATA: intermediate result chunk, forwarded verbatim.
    pub fn work_data(&mut self, worker: WorkerId, handle: &JobHandle, data: Vec<u8>) -> Result<()> {
        let job = self.held_running_job(worker, handle)?;
        let listeners: Vec<ClientId> = job.listeners.iter().copied().collect();
        self.router.notify(
            listeners.iter(),
            JobEvent::Data {
                handle: handle.clone(),
                data,
            },
        );
        Ok(())
    }

    /// WORK_WARNING: forwarded verbatim.
    pub fn work_warning(
        &mut self,
        worker: WorkerId,
        handle: &JobHandle,
        message: Vec<u8>,
    ) -> Result<()> {
        let job = self.held_running_job(worker, handle)?;
        let listeners: Vec<ClientId> = job.listeners.iter().copied().collect();
        self.router.notify(
            listeners.iter(),
            JobEvent::Warning {
                handle: handle.clone(),
                message,
            },
        );
        Ok(())
    }

    /// WORK_EXCEPTION: forwarded verbatim; the job stays running until the
    /// worker follows up with a completion or failure report.
    pub fn work_exception(
        &mut self,
        worker: WorkerId,
        handle: &JobHandle,
        payload: Vec<u8>,
    ) -> Result<()> {
        let job = self.held_running_job(worker, handle)?;
        let listeners: Vec<ClientId> = job.listeners.iter().copied().collect();
        self.router.notify(
            listeners.iter(),
            JobEvent::Exception {
                handle: handle.clone(),
                payload,
            },
        );
        Ok(())
    }

    /// WORK_COMPLETE: terminal success. Listeners are notified, the
    /// backend's `done` fires, the job leaves the registry.
    pub fn work_complete(
        &mut self,
        worker: WorkerId,
        handle: &JobHandle,
        result: Vec<u8>,
    ) -> Result<()> {
        self.registry.mark_complete(handle, worker)?;
        self.workers.get_mut(worker)?.current_job = None;

        let job = self.registry.remove(handle)?;
        self.router.notify(
            job.listeners.iter(),
            JobEvent::Complete {
                handle: handle.clone(),
                result,
            },
        );
        self.router.clear_interest(job.listeners.iter(), handle);
        tracing::info!(handle = %handle, worker = %worker, "Job complete");

        self.store
            .done(handle)
            .map_err(|e| BrokerError::Persistence(e.to_string()))
    }

    /// WORK_FAIL: terminal unless the retry budget allows a re-queue at
    /// the original priority (tail of the tier). Listeners hear every
    /// failure report, retried or not.
    pub fn work_fail(&mut self, worker: WorkerId, handle: &JobHandle, reason: &str) -> Result<()> {
        let state = self
            .registry
            .report_failure(handle, worker, self.config.retry_limit)?;
        self.workers.get_mut(worker)?.current_job = None;

        match state {
            JobState::Queued => {
                let job = self.registry.get(handle)?;
                let (function, priority, fail_count) =
                    (job.function_name.clone(), job.priority, job.fail_count);
                let listeners: Vec<ClientId> = job.listeners.iter().copied().collect();
                // The job stays live for the retry, so interest is kept.
                self.router.notify(
                    listeners.iter(),
                    JobEvent::Failed {
                        handle: handle.clone(),
                        reason: reason.to_string(),
                    },
                );
                tracing::info!(handle = %handle, fail_count, "Job failed, re-queueing");
                self.enqueue_and_dispatch(&function, handle.clone(), priority);
                Ok(())
            }
            _ => {
                let job = self.registry.remove(handle)?;
                self.router.notify(
                    job.listeners.iter(),
                    JobEvent::Failed {
                        handle: handle.clone(),
                        reason: reason.to_string(),
                    },
                );
                self.router.clear_interest(job.listeners.iter(), handle);
                tracing::info!(handle = %handle, worker = %worker, reason, "Job failed");

                self.store
                    .done(handle)
                    .map_err(|e| BrokerError::Persistence(e.to_string()))
            }
        }
    }

    /// Client status query. Unknown handles are answered, not errored:
    /// `known` is false, mirroring the protocol's status response.
    pub fn get_status(&self, handle: &JobHandle) -> JobStatusSnapshot {
        self.registry.status_snapshot(handle)
    }

    /// Explicit cancel from a client: terminal failure from any live
    /// state. A running worker's later report for this handle is rejected
    /// as an invalid transition.
    pub fn cancel_job(&mut self, handle: &JobHandle) -> Result<()> {
        let job = self.registry.get(handle)?;
        let function = job.function_name.clone();
        match job.state {
            JobState::Queued => {
                // Either in a pending ring or still on the scheduled heap;
                // the heap is lazily pruned on sweep.
                self.functions.remove_pending(&function, handle);
            }
            JobState::Running => {
                if let Some(worker) = job.assigned_worker {
                    if let Ok(session) = self.workers.get_mut(worker) {
                        session.current_job = None;
                    }
                }
            }
            _ => {}
        }

        let job = self.registry.remove(handle)?;
        self.router.notify(
            job.listeners.iter(),
            JobEvent::Failed {
                handle: handle.clone(),
                reason: "cancelled".to_string(),
            },
        );
        self.router.clear_interest(job.listeners.iter(), handle);
        tracing::info!(handle = %handle, "Job cancelled");

        self.store
            .done(handle)
            .map_err(|e| BrokerError::Persistence(e.to_string()))
    }

    /// Client connection closed: stop delivering to it and prune it from
    /// every listener set. Jobs themselves are unaffected.
    pub fn client_gone(&mut self, client: ClientId) {
        let handles = self.router.detach(client);
        for handle in handles {
            if let Ok(job) = self.registry.get_mut(&handle) {
                job.listeners.remove(&client);
            }
        }
        tracing::debug!(client = %client, "Client disconnected");
    }

    /// Worker connection closed: its running job (if any) returns to the
    /// head of its priority tier with `fail_count` untouched; the worker,
    /// not the job, is presumed at fault.
    pub fn worker_gone(&mut self, worker: WorkerId) {
        self.functions.unpark_worker(worker);
        let Some(session) = self.workers.remove(worker) else {
            return;
        };
        if let Some(handle) = session.current_job {
            if self.registry.mark_requeued(&handle).is_ok() {
                tracing::info!(handle = %handle, worker = %worker, "Worker dropped, re-queueing job at head");
                self.requeue_head(&handle);
                if let Ok(job) = self.registry.get(&handle) {
                    let function = job.function_name.clone();
                    self.dispatch_function(&function);
                }
            }
        }
        tracing::debug!(worker = %worker, "Worker disconnected");
    }

    /// Move due scheduled jobs into dispatch visibility. Driven by the
    /// broker task's interval tick.
    pub fn sweep(&mut self, now: DateTime<Utc>) {
        loop {
            let due = matches!(self.scheduled.peek(), Some(Reverse((at, _, _))) if *at <= now);
            if !due {
                break;
            }
            let Some(Reverse((_, _, handle))) = self.scheduled.pop() else {
                break;
            };
            // Cancelled while scheduled: nothing to enqueue.
            let Ok(job) = self.registry.get(&handle) else {
                continue;
            };
            let (function, priority) = (job.function_name.clone(), job.priority);
            tracing::debug!(handle = %handle, function = %function, "Scheduled job due");
            self.enqueue_and_dispatch(&function, handle, priority);
        }
    }

    /// Force buffered backend writes to stable storage.
    pub fn flush_store(&mut self) -> Result<()> {
        self.store
            .flush()
            .map_err(|e| BrokerError::Persistence(e.to_string()))
    }

    /// Admin: per-function queue depth, running count, and capable workers.
    pub fn function_stats(&self) -> Vec<FunctionStats> {
        let mut stats: Vec<FunctionStats> = self
            .functions
            .function_names()
            .map(|name| {
                let queued = self.functions.get(name).map_or(0, |f| f.depth());
                let running = self
                    .registry
                    .jobs_in_state(JobState::Running)
                    .iter()
                    .filter(|j| j.function_name == name)
                    .count();
                FunctionStats {
                    name: name.to_string(),
                    queued,
                    running,
                    workers: self.workers.capable_count(name),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Admin: jobs currently in `state`, oldest first.
    pub fn jobs_in_state(&self, state: JobState) -> Vec<JobSummary> {
        self.registry
            .jobs_in_state(state)
            .into_iter()
            .map(|job| JobSummary {
                handle: job.handle.clone(),
                function_name: job.function_name.clone(),
                state: job.state,
                priority: job.priority,
            })
            .collect()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}
