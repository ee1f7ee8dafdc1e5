use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Error;
use crossbeam_channel::{Receiver, Sender};

use taskprep_store::StateFile;

use crate::delay::DelayQueue;
use crate::job::{Job, JobId, JobStatus, JobType, TargetRef};
use crate::table::JobTable;
use crate::QueueError;

/// Default delay of the first dependency-wait re-publication.
pub const BASE_WAIT: Duration = Duration::from_secs(3);
/// Upper bound of the dependency-wait delay.
pub const MAX_WAIT: Duration = Duration::from_secs(120);
/// How many re-publications a job gets before giving up on its dependencies.
pub const MAX_ATTEMPTS: u32 = 100;

/// Tunables of the scheduler retry policy.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay of the first re-publication.
    pub base_wait: Duration,
    /// Upper bound of the re-publication delay.
    pub max_wait: Duration,
    /// Bound on the number of re-publications of a single job.
    pub max_attempts: u32,
}

impl Default for SchedulerConfig {
    fn default() -> SchedulerConfig {
        SchedulerConfig {
            base_wait: BASE_WAIT,
            max_wait: MAX_WAIT,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

/// The delay before the `attempt`-th re-publication of a job:
/// `min(max_wait, base_wait × attempt)`.
pub fn backoff_delay(config: &SchedulerConfig, attempt: u32) -> Duration {
    (config.base_wait * attempt).min(config.max_wait)
}

/// The verdict of the dependency check of a job.
#[derive(Debug)]
pub enum DependencyVerdict {
    /// All the prerequisites are in terminal states the job can work with: proceed to execute.
    Ready,
    /// At least one prerequisite is still progressing. The worker requests the missing
    /// prerequisites and re-publishes the job with a back-off delay.
    NotReady {
        /// The prerequisites to request, idempotently.
        missing: Vec<(TargetRef, JobType)>,
    },
    /// A prerequisite is in a terminal failure state; the job finishes with no artifact.
    Failed(String),
}

/// The terminal outcome of the execution of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCompletion {
    /// The effect completed and the artifacts are committed.
    Success,
    /// The effect failed deterministically; the message is recorded against the target.
    Failure(String),
}

/// The effectful half of a job type, one implementation per [`JobType`] in a lookup table.
///
/// Execution is split at the dependency-check boundary: `validate_dependencies` is the only point
/// where a job may suspend itself, `execute` runs only after a `Ready` verdict.
pub trait JobHandler: Send + Sync {
    /// Check whether the prerequisites of the job hold.
    ///
    /// A returned `Err` counts as a transient internal fault and is retried with the same back-off
    /// as a dependency wait.
    fn validate_dependencies(
        &self,
        scheduler: &Scheduler,
        job: &Job,
    ) -> Result<DependencyVerdict, Error>;

    /// Perform the effect of the job. Runs only after a `Ready` verdict.
    ///
    /// A returned `Err` counts as a transient internal fault and is retried; a
    /// [`JobCompletion::Failure`] is terminal and never retried.
    fn execute(&self, scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error>;

    /// Record against the target that a prerequisite of the job failed. Called once, before the
    /// job finishes with the same message.
    fn dependency_failed(&self, job: &Job, message: &str);

    /// Record against the target that the job itself gave up, e.g. after exhausting its attempts.
    fn job_failed(&self, job: &Job, message: &str);
}

/// Message consumed by the workers of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMessage {
    /// Run the job with this id.
    Run(JobId),
    /// Stop the worker.
    Exit,
}

/// The single authority converting "ensure artifact X is ready" requests into a sequence of
/// effectful jobs.
///
/// The scheduler enforces the at-most-one-active-job invariant per `(target, job_type)` by
/// coalescing requests onto the already-published job, discovers the dependency DAG on demand via
/// the [`JobHandler`] verdicts, and re-publishes waiting jobs with a bounded back-off.
pub struct Scheduler {
    /// The durable job table.
    table: Mutex<JobTable>,
    /// Signalled at every observable mutation of the table.
    changed: Condvar,
    /// The handler of each job type.
    handlers: HashMap<JobType, Box<dyn JobHandler>>,
    /// The sending half of the worker queue.
    pub(crate) sender: Sender<WorkerMessage>,
    /// The delayed re-publications.
    pub(crate) delay: DelayQueue,
    /// The retry policy.
    config: SchedulerConfig,
}

impl Scheduler {
    /// Make a new `Scheduler` persisting the job table in the given state file. Returns the
    /// scheduler and the receiving half of the worker queue, to be passed to the pool.
    pub fn new(
        state_file: StateFile,
        handlers: HashMap<JobType, Box<dyn JobHandler>>,
        config: SchedulerConfig,
    ) -> Result<(Scheduler, Receiver<WorkerMessage>), Error> {
        let table = JobTable::load(state_file)?;
        let (sender, receiver) = crossbeam_channel::unbounded();
        Ok((
            Scheduler {
                table: Mutex::new(table),
                changed: Condvar::new(),
                handlers,
                sender,
                delay: DelayQueue::new(),
                config,
            },
            receiver,
        ))
    }

    /// Ensure a job is active for the pair, returning the identifier of the active (new or
    /// pre-existing) job.
    pub fn request(&self, target: TargetRef, job_type: JobType) -> Result<JobId, QueueError> {
        let mut table = self.table.lock().unwrap();
        if let Some(job) = table.active_job(&target, job_type) {
            return Ok(job.id);
        }
        debug!("Requesting {} for {}", job_type, target);
        let id = table.enqueue(target, job_type)?;
        self.changed.notify_all();
        self.sender
            .send(WorkerMessage::Run(id))
            .map_err(|_| QueueError::ResourceUnavailable("worker queue is closed".into()))?;
        Ok(id)
    }

    /// The current status of the pair: the state of the latest job and, if finished, its terminal
    /// outcome. `None` if the pair was never requested.
    pub fn status(&self, target: &TargetRef, job_type: JobType) -> Option<JobStatus> {
        self.table.lock().unwrap().status(target, job_type)
    }

    /// Block until the pair reaches a terminal state, up to the timeout. Returns the last observed
    /// status.
    pub fn wait(
        &self,
        target: &TargetRef,
        job_type: JobType,
        timeout: Duration,
    ) -> Option<JobStatus> {
        let deadline = Instant::now() + timeout;
        let mut table = self.table.lock().unwrap();
        loop {
            let status = table.status(target, job_type);
            let finished = matches!(&status, Some(status) if status.outcome.is_some());
            let now = Instant::now();
            if finished || now >= deadline {
                return status;
            }
            let (guard, _) = self
                .changed
                .wait_timeout(table, deadline - now)
                .unwrap();
            table = guard;
        }
    }

    /// Re-publish the jobs left active by a previous run.
    pub fn recover(&self) -> Result<(), QueueError> {
        let active = self.table.lock().unwrap().active_jobs();
        for id in active {
            info!("Recovering job {} from a previous run", id);
            self.sender
                .send(WorkerMessage::Run(id))
                .map_err(|_| QueueError::ResourceUnavailable("worker queue is closed".into()))?;
        }
        Ok(())
    }

    /// Run one job to its next state transition. Called by the workers of the pool.
    pub(crate) fn process_job(&self, id: JobId) {
        if let Err(e) = self.process_job_inner(id) {
            error!("Processing of job {} failed: {:?}", id, e);
        }
    }

    fn process_job_inner(&self, id: JobId) -> Result<(), QueueError> {
        let job = self.table.lock().unwrap().lease(id)?;
        let job = match job {
            Some(job) => job,
            // the job reached a terminal state in the meantime, e.g. a recovered duplicate
            None => return Ok(()),
        };
        trace!("Worker picked up {} for {}", job.job_type, job.target);
        let handler = match self.handlers.get(&job.job_type) {
            Some(handler) => handler,
            None => {
                return self.finish(id, Some(format!("No handler for job type {}", job.job_type)))
            }
        };
        let verdict = match handler.validate_dependencies(self, &job) {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!("Dependency check of {} failed: {:?}", job.target, e);
                return self.backoff_or_give_up(
                    handler.as_ref(),
                    &job,
                    &format!("Dependency check kept failing: {}", e),
                );
            }
        };
        match verdict {
            DependencyVerdict::Ready => match handler.execute(self, &job) {
                Ok(JobCompletion::Success) => self.finish(id, None),
                Ok(JobCompletion::Failure(message)) => {
                    debug!("Job {} for {} failed: {}", id, job.target, message);
                    self.finish(id, Some(message))
                }
                Err(e) => {
                    warn!("Execution of {} errored: {:?}", job.target, e);
                    self.backoff_or_give_up(
                        handler.as_ref(),
                        &job,
                        &format!("Execution kept failing: {}", e),
                    )
                }
            },
            DependencyVerdict::NotReady { missing } => {
                for (target, job_type) in missing {
                    self.request(target, job_type)?;
                }
                self.backoff_or_give_up(
                    handler.as_ref(),
                    &job,
                    "Dependencies did not become ready",
                )
            }
            DependencyVerdict::Failed(message) => {
                handler.dependency_failed(&job, &message);
                self.finish(id, Some(message))
            }
        }
    }

    /// Put a job back in the queue after a back-off, or give up when the attempts are exhausted.
    fn backoff_or_give_up(
        &self,
        handler: &dyn JobHandler,
        job: &Job,
        give_up_message: &str,
    ) -> Result<(), QueueError> {
        let attempt = self.table.lock().unwrap().requeue(job.id)?;
        if attempt > self.config.max_attempts {
            let message = format!(
                "Giving up after {} attempts: {}",
                self.config.max_attempts, give_up_message
            );
            handler.job_failed(job, &message);
            return self.finish(job.id, Some(message));
        }
        let delay = backoff_delay(&self.config, attempt);
        trace!(
            "Job {} for {} re-published, attempt {} in {:?}",
            job.id,
            job.target,
            attempt,
            delay
        );
        self.delay.push(Instant::now() + delay, job.id);
        Ok(())
    }

    /// Mark a job as finished.
    fn finish(&self, id: JobId, failure: Option<String>) -> Result<(), QueueError> {
        let mut table = self.table.lock().unwrap();
        table.finish(id, failure)?;
        self.changed.notify_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn config(base_ms: u64, max_ms: u64) -> SchedulerConfig {
        SchedulerConfig {
            base_wait: Duration::from_millis(base_ms),
            max_wait: Duration::from_millis(max_ms),
            max_attempts: 10,
        }
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let config = config(3000, 120_000);
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(3));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(6));
        assert_eq!(backoff_delay(&config, 10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = config(3000, 120_000);
        assert_eq!(backoff_delay(&config, 100), Duration::from_secs(120));
    }
}
