//! The async front of the broker: a single tokio task owns the
//! [`Engine`] and serializes every decoded command through a channel,
//! so all read-then-write sequences on the shared indices are atomic by
//! construction. The transport layer talks to it through a cheap-clone
//! [`BrokerHandle`].

use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::broker::engine::{Engine, FunctionStats, JobSummary, Submission};
use crate::broker::events::JobEvent;
use crate::broker::job::{ClientId, JobHandle, JobState, JobStatusSnapshot, WorkerId};
use crate::broker::registry::Created;
use crate::broker::workers::Assignment;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};
use crate::storage::JobStore;

/// Decoded commands accepted by the broker task. Shapes mirror the wire
/// protocol's command set; framing and parsing live in the transport.
#[derive(Debug)]
pub enum Command {
    AttachClient {
        client: ClientId,
        response_tx: oneshot::Sender<mpsc::Receiver<JobEvent>>,
    },
    Submit {
        client: Option<ClientId>,
        submission: Submission,
        response_tx: oneshot::Sender<Result<Created>>,
    },
    GetStatus {
        handle: JobHandle,
        response_tx: oneshot::Sender<JobStatusSnapshot>,
    },
    CancelJob {
        handle: JobHandle,
        response_tx: oneshot::Sender<Result<()>>,
    },
    ClientGone {
        client: ClientId,
    },
    RegisterWorker {
        worker: WorkerId,
        function: String,
    },
    UnregisterWorker {
        worker: WorkerId,
        function: String,
    },
    GrabJob {
        worker: WorkerId,
        park: Option<oneshot::Sender<Assignment>>,
        response_tx: oneshot::Sender<Result<Option<Assignment>>>,
    },
    CancelGrab {
        worker: WorkerId,
    },
    StatusUpdate {
        worker: WorkerId,
        handle: JobHandle,
        numerator: u32,
        denominator: u32,
        response_tx: oneshot::Sender<Result<()>>,
    },
    WorkData {
        worker: WorkerId,
        handle: JobHandle,
        data: Vec<u8>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    WorkWarning {
        worker: WorkerId,
        handle: JobHandle,
        message: Vec<u8>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    WorkException {
        worker: WorkerId,
        handle: JobHandle,
        payload: Vec<u8>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    WorkComplete {
        worker: WorkerId,
        handle: JobHandle,
        result: Vec<u8>,
        response_tx: oneshot::Sender<Result<()>>,
    },
    WorkFail {
        worker: WorkerId,
        handle: JobHandle,
        reason: String,
        response_tx: oneshot::Sender<Result<()>>,
    },
    WorkerGone {
        worker: WorkerId,
    },
    FunctionStats {
        response_tx: oneshot::Sender<Vec<FunctionStats>>,
    },
    JobsInState {
        state: JobState,
        response_tx: oneshot::Sender<Vec<JobSummary>>,
    },
    Flush {
        response_tx: oneshot::Sender<Result<()>>,
    },
}

/// Owns the engine and its command loop. Constructed with a storage
/// backend, which is replayed before any command is accepted.
pub struct Broker {
    engine: Engine,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        store: Box<dyn JobStore>,
    ) -> Result<(Self, BrokerHandle, mpsc::Receiver<Command>)> {
        let (command_tx, command_rx) = mpsc::channel(config.command_channel_capacity);
        let engine = Engine::new(config, store)?;
        Ok((Self { engine }, BrokerHandle { command_tx }, command_rx))
    }

    /// Run the command loop. Exits when every handle is dropped.
    pub async fn run(mut self, mut command_rx: mpsc::Receiver<Command>) {
        let mut sweep = tokio::time::interval(Duration::from_millis(
            self.engine.config().sweep_interval_ms,
        ));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd),
                        None => {
                            tracing::info!("Command channel closed, broker stopping");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.engine.sweep(Utc::now());
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::AttachClient {
                client,
                response_tx,
            } => {
                let rx = self.engine.attach_client(client);
                let _ = response_tx.send(rx);
            }
            Command::Submit {
                client,
                submission,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.submit_job(client, submission));
            }
            Command::GetStatus {
                handle,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.get_status(&handle));
            }
            Command::CancelJob {
                handle,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.cancel_job(&handle));
            }
            Command::ClientGone { client } => self.engine.client_gone(client),
            Command::RegisterWorker { worker, function } => {
                self.engine.worker_register(worker, &function);
            }
            Command::UnregisterWorker { worker, function } => {
                if let Err(err) = self.engine.worker_unregister(worker, &function) {
                    tracing::warn!(worker = %worker, function, error = %err, "Unregister rejected");
                }
            }
            Command::GrabJob {
                worker,
                park,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.grab_job(worker, park));
            }
            Command::CancelGrab { worker } => self.engine.cancel_grab(worker),
            Command::StatusUpdate {
                worker,
                handle,
                numerator,
                denominator,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.status_update(
                    worker,
                    &handle,
                    numerator,
                    denominator,
                ));
            }
            Command::WorkData {
                worker,
                handle,
                data,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.work_data(worker, &handle, data));
            }
            Command::WorkWarning {
                worker,
                handle,
                message,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.work_warning(worker, &handle, message));
            }
            Command::WorkException {
                worker,
                handle,
                payload,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.work_exception(worker, &handle, payload));
            }
            Command::WorkComplete {
                worker,
                handle,
                result,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.work_complete(worker, &handle, result));
            }
            Command::WorkFail {
                worker,
                handle,
                reason,
                response_tx,
            } => {
                let _ = response_tx.send(self.engine.work_fail(worker, &handle, &reason));
            }
            Command::WorkerGone { worker } => self.engine.worker_gone(worker),
            Command::FunctionStats { response_tx } => {
                let _ = response_tx.send(self.engine.function_stats());
            }
            Command::JobsInState { state, response_tx } => {
                let _ = response_tx.send(self.engine.jobs_in_state(state));
            }
            Command::Flush { response_tx } => {
                let _ = response_tx.send(self.engine.flush_store());
            }
        }
    }
}

/// Cheap-clone entry point for the transport layer: one async method per
/// decoded command, each a send over the command channel plus a oneshot
/// await for the reply.
#[derive(Clone)]
pub struct BrokerHandle {
    command_tx: mpsc::Sender<Command>,
}

impl BrokerHandle {
    async fn send(&self, cmd: Command) -> Result<()> {
        self.command_tx
            .send(cmd)
            .await
            .map_err(|_| BrokerError::BrokerClosed)
    }

    async fn request<T>(
        &self,
        rx: oneshot::Receiver<T>,
        cmd: Command,
    ) -> Result<T> {
        self.send(cmd).await?;
        rx.await.map_err(|_| BrokerError::BrokerClosed)
    }

    /// Register a client connection; the returned receiver carries every
    /// job event for handles this client listens on.
    pub async fn attach_client(&self, client: ClientId) -> Result<mpsc::Receiver<JobEvent>> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::AttachClient {
                client,
                response_tx,
            },
        )
        .await
    }

    pub async fn submit_job(
        &self,
        client: Option<ClientId>,
        submission: Submission,
    ) -> Result<Created> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::Submit {
                client,
                submission,
                response_tx,
            },
        )
        .await?
    }

    pub async fn get_status(&self, handle: JobHandle) -> Result<JobStatusSnapshot> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::GetStatus {
                handle,
                response_tx,
            },
        )
        .await
    }

    pub async fn cancel_job(&self, handle: JobHandle) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::CancelJob {
                handle,
                response_tx,
            },
        )
        .await?
    }

    pub async fn client_gone(&self, client: ClientId) -> Result<()> {
        self.send(Command::ClientGone { client }).await
    }

    pub async fn register_worker(&self, worker: WorkerId, function: impl Into<String>) -> Result<()> {
        self.send(Command::RegisterWorker {
            worker,
            function: function.into(),
        })
        .await
    }

    pub async fn unregister_worker(
        &self,
        worker: WorkerId,
        function: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::UnregisterWorker {
            worker,
            function: function.into(),
        })
        .await
    }

    /// Ask for work. With `wait` of `None` this is a poll: `Ok(None)`
    /// means no job. With a timeout the call parks until a matching job
    /// arrives, the timeout elapses, or the broker goes away; a job handed
    /// off in the instant the timeout fires is either returned or put back
    /// at the head of its queue, never lost.
    pub async fn grab_job(
        &self,
        worker: WorkerId,
        wait: Option<Duration>,
    ) -> Result<Option<Assignment>> {
        let Some(wait) = wait else {
            let (response_tx, rx) = oneshot::channel();
            return self
                .request(
                    rx,
                    Command::GrabJob {
                        worker,
                        park: None,
                        response_tx,
                    },
                )
                .await?;
        };

        let (park_tx, mut park_rx) = oneshot::channel();
        let (response_tx, rx) = oneshot::channel();
        if let Some(assignment) = self
            .request(
                rx,
                Command::GrabJob {
                    worker,
                    park: Some(park_tx),
                    response_tx,
                },
            )
            .await??
        {
            return Ok(Some(assignment));
        }

        match tokio::time::timeout(wait, &mut park_rx).await {
            Ok(Ok(assignment)) => Ok(Some(assignment)),
            // Responder dropped by the broker (worker deregistered or
            // broker shut down): report no job.
            Ok(Err(_)) => Ok(None),
            Err(_elapsed) => {
                // A hand-off may have landed between the timeout firing
                // and now; take it rather than losing it.
                if let Ok(assignment) = park_rx.try_recv() {
                    return Ok(Some(assignment));
                }
                drop(park_rx);
                self.send(Command::CancelGrab { worker }).await?;
                Ok(None)
            }
        }
    }

    pub async fn status_update(
        &self,
        worker: WorkerId,
        handle: JobHandle,
        numerator: u32,
        denominator: u32,
    ) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::StatusUpdate {
                worker,
                handle,
                numerator,
                denominator,
                response_tx,
            },
        )
        .await?
    }

    pub async fn work_data(
        &self,
        worker: WorkerId,
        handle: JobHandle,
        data: Vec<u8>,
    ) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::WorkData {
                worker,
                handle,
                data,
                response_tx,
            },
        )
        .await?
    }

    pub async fn work_warning(
        &self,
        worker: WorkerId,
        handle: JobHandle,
        message: Vec<u8>,
    ) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::WorkWarning {
                worker,
                handle,
                message,
                response_tx,
            },
        )
        .await?
    }

    pub async fn work_exception(
        &self,
        worker: WorkerId,
        handle: JobHandle,
        payload: Vec<u8>,
    ) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::WorkException {
                worker,
                handle,
                payload,
                response_tx,
            },
        )
        .await?
    }

    pub async fn work_complete(
        &self,
        worker: WorkerId,
        handle: JobHandle,
        result: Vec<u8>,
    ) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::WorkComplete {
                worker,
                handle,
                result,
                response_tx,
            },
        )
        .await?
    }

    pub async fn work_fail(
        &self,
        worker: WorkerId,
        handle: JobHandle,
        reason: impl Into<String>,
    ) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(
            rx,
            Command::WorkFail {
                worker,
                handle,
                reason: reason.into(),
                response_tx,
            },
        )
        .await?
    }

    pub async fn worker_gone(&self, worker: WorkerId) -> Result<()> {
        self.send(Command::WorkerGone { worker }).await
    }

    pub async fn function_stats(&self) -> Result<Vec<FunctionStats>> {
        let (response_tx, rx) = oneshot::channel();
        self.request(rx, Command::FunctionStats { response_tx }).await
    }

    pub async fn jobs_in_state(&self, state: JobState) -> Result<Vec<JobSummary>> {
        let (response_tx, rx) = oneshot::channel();
        self.request(rx, Command::JobsInState { state, response_tx })
            .await
    }

    pub async fn flush(&self) -> Result<()> {
        let (response_tx, rx) = oneshot::channel();
        self.request(rx, Command::Flush { response_tx }).await?
    }
}
