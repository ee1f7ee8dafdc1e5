//! The dependency-aware job scheduler of the preparation pipeline.
//!
//! A request "ensure artifact X is ready" becomes a [`Job`] targeting X, published to a durable
//! queue and consumed by a pool of stateless workers. The dependency DAG is not topologically
//! sorted upfront: when a worker picks up a job it first runs the
//! [`validate_dependencies`](JobHandler::validate_dependencies) step, and on a
//! [`NotReady`](DependencyVerdict::NotReady) verdict it requests the missing prerequisites
//! (idempotently, thanks to job coalescing) and re-publishes the same job with a bounded linear
//! back-off. Since the set of job types is fixed and statically acyclic this discovers the DAG by
//! demand while guaranteeing progress.
//!
//! At most one job per `(target, job_type)` pair is active at any moment: concurrent requests for
//! the same target observe the already-published job.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

mod delay;
mod job;
mod scheduler;
mod table;
mod worker;

pub use job::{InvocationId, Job, JobId, JobOutcome, JobState, JobStatus, JobType, TargetRef};
pub use scheduler::{
    backoff_delay, DependencyVerdict, JobCompletion, JobHandler, Scheduler, SchedulerConfig,
    WorkerMessage, BASE_WAIT, MAX_ATTEMPTS, MAX_WAIT,
};
pub use worker::WorkerPool;

use thiserror::Error;

/// The errors surfaced by the scheduler operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The durable queue cannot be contacted; the request cannot be accepted.
    #[error("the persistent queue cannot be contacted: {0}")]
    ResourceUnavailable(String),
}
