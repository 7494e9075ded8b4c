//! The broker core: job registry, function table, worker sessions, and
//! the dispatch engine that ties them together.
//!
//! # Components
//!
//! - [`job`]: job records, handles, priorities, and the state enum
//! - [`registry::JobRegistry`]: sole owner of job records, handle + unique-key indices
//! - [`functions::FunctionTable`]: per-function pending queues and waiting workers
//! - [`workers::WorkerTable`]: per-connection worker sessions
//! - [`engine::Engine`]: the matching algorithm and job state machine
//! - [`events::NotificationRouter`]: fan-out of job events to listening clients
//!
//! The engine is synchronous and single-owner; [`crate::server`] wraps it
//! in a tokio task fed by a command channel.

pub mod engine;
pub mod events;
pub mod functions;
pub mod job;
pub mod registry;
pub mod workers;

pub use engine::{Engine, FunctionStats, JobSummary, Submission};
pub use events::JobEvent;
pub use job::{ClientId, Job, JobHandle, JobState, JobStatusSnapshot, Priority, WorkerId};
pub use registry::Created;
pub use workers::Assignment;
