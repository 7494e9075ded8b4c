pub mod broker;
pub mod config;
pub mod error;
pub mod server;
pub mod storage;

pub use broker::{
    Assignment, ClientId, Created, JobEvent, JobHandle, JobState, Priority, Submission, WorkerId,
};
pub use config::{BrokerConfig, Durability};
pub use error::{BrokerError, Result};
pub use server::{Broker, BrokerHandle};
pub use storage::{JobStore, MemoryStore};
