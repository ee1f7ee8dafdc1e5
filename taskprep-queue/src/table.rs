use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use taskprep_store::StateFile;

use crate::job::{Job, JobId, JobOutcome, JobState, JobStatus, JobType, TargetRef};
use crate::QueueError;

/// The persisted content of the job table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct JobTableData {
    /// All the known jobs, by id.
    jobs: HashMap<JobId, Job>,
    /// The latest job of each `(target, job_type)` pair. The pair has an active job iff the
    /// referenced job is not finished.
    by_target: HashMap<(TargetRef, JobType), JobId>,
}

/// The durable table of the jobs, the single authority on which job is active for each
/// `(target, job_type)` pair.
///
/// Every mutation is persisted before being observable, so a crashed run can recover the queue
/// from the snapshot.
#[derive(Debug)]
pub(crate) struct JobTable {
    data: JobTableData,
    state_file: StateFile,
}

impl JobTable {
    /// Load the table from its snapshot, or start empty.
    pub fn load(state_file: StateFile) -> Result<JobTable, anyhow::Error> {
        let data = state_file.load()?;
        Ok(JobTable { data, state_file })
    }

    /// Persist the table. A failure here means the durable queue cannot be contacted.
    fn persist(&self) -> Result<(), QueueError> {
        self.state_file
            .save(&self.data)
            .map_err(|e| QueueError::ResourceUnavailable(e.to_string()))
    }

    /// The active job for the pair, if any.
    pub fn active_job(&self, target: &TargetRef, job_type: JobType) -> Option<&Job> {
        let id = self.data.by_target.get(&(target.clone(), job_type))?;
        let job = &self.data.jobs[id];
        job.is_active().then_some(job)
    }

    /// The observable status of the pair: the latest job, active or finished.
    pub fn status(&self, target: &TargetRef, job_type: JobType) -> Option<JobStatus> {
        let id = self.data.by_target.get(&(target.clone(), job_type))?;
        let job = &self.data.jobs[id];
        let outcome = match (job.state, &job.failure) {
            (JobState::Finished, None) => Some(JobOutcome::Success),
            (JobState::Finished, Some(msg)) => Some(JobOutcome::Failure(msg.clone())),
            _ => None,
        };
        Some(JobStatus {
            id: job.id,
            state: job.state,
            outcome,
        })
    }

    /// Publish a new job for the pair, enforcing the single-active-job invariant: when the pair
    /// already has an active job, that job is returned instead and nothing is created.
    pub fn enqueue(&mut self, target: TargetRef, job_type: JobType) -> Result<JobId, QueueError> {
        if let Some(job) = self.active_job(&target, job_type) {
            trace!(
                "Coalescing request for {} ({}) into job {}",
                target,
                job_type,
                job.id
            );
            return Ok(job.id);
        }
        let mut job = Job::new(job_type, target.clone());
        let id = job.id;
        job.state = JobState::Queued;
        job.queue_reference = Some(id.to_string());
        self.data.by_target.insert((target, job_type), id);
        self.data.jobs.insert(id, job);
        self.persist()?;
        Ok(id)
    }

    /// Mark a job as running and return a snapshot of it, or `None` if it is already terminal.
    pub fn lease(&mut self, id: JobId) -> Result<Option<Job>, QueueError> {
        let job = match self.data.jobs.get_mut(&id) {
            Some(job) => job,
            None => return Ok(None),
        };
        if job.state == JobState::Finished {
            return Ok(None);
        }
        job.state = JobState::Running;
        let snapshot = job.clone();
        self.persist()?;
        Ok(Some(snapshot))
    }

    /// Put a running job back in the queue for another attempt, returning the new attempt count.
    pub fn requeue(&mut self, id: JobId) -> Result<u32, QueueError> {
        let job = self
            .data
            .jobs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("Requeue of unknown job {}", id));
        job.state = JobState::Queued;
        job.attempt_count += 1;
        let attempt = job.attempt_count;
        self.persist()?;
        Ok(attempt)
    }

    /// Mark a job as finished, with an optional failure message.
    pub fn finish(&mut self, id: JobId, failure: Option<String>) -> Result<(), QueueError> {
        let job = self
            .data
            .jobs
            .get_mut(&id)
            .unwrap_or_else(|| panic!("Finish of unknown job {}", id));
        job.state = JobState::Finished;
        job.failure = failure;
        job.queue_reference = None;
        self.persist()?;
        Ok(())
    }

    /// The jobs left active by a previous run, to be re-published on startup.
    pub fn active_jobs(&self) -> Vec<JobId> {
        self.data
            .jobs
            .values()
            .filter(|job| job.is_active())
            .map(|job| job.id)
            .collect()
    }

    /// Count the active jobs for a pair, used by the tests to check the invariant.
    #[cfg(test)]
    pub fn count_active(&self, target: &TargetRef, job_type: JobType) -> usize {
        self.data
            .jobs
            .values()
            .filter(|job| job.is_active() && job.target == *target && job.job_type == job_type)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use taskprep_store::{CommitId, SourceKind};

    use super::*;

    fn make_table(cwd: &TempDir) -> JobTable {
        JobTable::load(StateFile::new(cwd.path().join("jobs.bin"))).unwrap()
    }

    fn target() -> TargetRef {
        TargetRef::Source {
            commit: CommitId::new("p", "abcdef"),
            kind: SourceKind::Solution,
            name: "sol.cpp".into(),
        }
    }

    #[test]
    fn test_enqueue_coalesces() {
        let cwd = TempDir::new().unwrap();
        let mut table = make_table(&cwd);
        let id1 = table.enqueue(target(), JobType::Compile).unwrap();
        let id2 = table.enqueue(target(), JobType::Compile).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(table.count_active(&target(), JobType::Compile), 1);
    }

    #[test]
    fn test_enqueue_after_finish_makes_new_job() {
        let cwd = TempDir::new().unwrap();
        let mut table = make_table(&cwd);
        let id1 = table.enqueue(target(), JobType::Compile).unwrap();
        table.finish(id1, None).unwrap();
        let id2 = table.enqueue(target(), JobType::Compile).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(table.count_active(&target(), JobType::Compile), 1);
    }

    #[test]
    fn test_status_tracks_outcome() {
        let cwd = TempDir::new().unwrap();
        let mut table = make_table(&cwd);
        assert_eq!(table.status(&target(), JobType::Compile), None);
        let id = table.enqueue(target(), JobType::Compile).unwrap();
        assert_eq!(
            table.status(&target(), JobType::Compile).unwrap().state,
            JobState::Queued
        );
        table.lease(id).unwrap().unwrap();
        assert_eq!(
            table.status(&target(), JobType::Compile).unwrap().state,
            JobState::Running
        );
        table.finish(id, Some("boom".into())).unwrap();
        let status = table.status(&target(), JobType::Compile).unwrap();
        assert_eq!(status.state, JobState::Finished);
        assert_eq!(status.outcome, Some(JobOutcome::Failure("boom".into())));
    }

    #[test]
    fn test_lease_terminal_job() {
        let cwd = TempDir::new().unwrap();
        let mut table = make_table(&cwd);
        let id = table.enqueue(target(), JobType::Compile).unwrap();
        table.finish(id, None).unwrap();
        assert!(table.lease(id).unwrap().is_none());
    }

    #[test]
    fn test_requeue_counts_attempts() {
        let cwd = TempDir::new().unwrap();
        let mut table = make_table(&cwd);
        let id = table.enqueue(target(), JobType::Compile).unwrap();
        table.lease(id).unwrap();
        assert_eq!(table.requeue(id).unwrap(), 1);
        table.lease(id).unwrap();
        assert_eq!(table.requeue(id).unwrap(), 2);
    }

    #[test]
    fn test_recover_from_snapshot() {
        let cwd = TempDir::new().unwrap();
        let id = {
            let mut table = make_table(&cwd);
            table.enqueue(target(), JobType::Compile).unwrap()
        };
        let table = make_table(&cwd);
        assert_eq!(table.active_jobs(), vec![id]);
    }
}
