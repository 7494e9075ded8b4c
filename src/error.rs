use thiserror::Error;

use crate::broker::job::JobHandle;

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Job not found: {0}")]
    JobNotFound(JobHandle),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Worker not found: {0}")]
    WorkerNotFound(u64),

    #[error("Invalid transition for job {handle}: {detail}")]
    InvalidTransition { handle: JobHandle, detail: String },

    #[error("Pending queue full for function {0}")]
    QueueFull(String),

    #[error("Duplicate job exists in durable storage for ({function}, {unique})")]
    DuplicateDurable { function: String, unique: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Broker is shut down")]
    BrokerClosed,
}

pub type Result<T> = std::result::Result<T, BrokerError>;
