#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod consumer;
mod errors;
mod executor;
mod fanout;
mod handler;
mod job;
mod publisher;
/// Database schema definitions.
pub mod schema;
mod sieve;
mod storage;
mod util;
mod worker;

/// Error type for the schedule operation.
pub use self::errors::ScheduleError;
/// Handler registration and the handler result contract.
pub use self::handler::{HandlerMap, Transition};
/// Public queue operations.
pub use self::job::{cancel, schedule, status};
/// Idempotent schema creation.
pub use self::storage::initialize;
/// The worker runtime and its configuration.
pub use self::worker::{Worker, WorkerBuilder};
