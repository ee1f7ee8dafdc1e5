use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskprep_store::{CommitId, SourceKind};

/// The identifier of a job, globally unique.
pub type JobId = Uuid;

/// The identifier of an invocation, globally unique.
pub type InvocationId = Uuid;

/// The kind of effect a job performs. The set is fixed and the dependency graph between the kinds
/// is statically acyclic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobType {
    /// Initialize the judge for a problem commit.
    JudgeInit,
    /// Compile a named source.
    Compile,
    /// Produce the input artifact of a test case.
    GenerateInput,
    /// Run a validator on the input of a test case.
    Validate,
    /// Produce the reference output of a test case with the model solution.
    GenerateOutput,
    /// Judge one (invocation, solution, test case) cell.
    EvaluateCell,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobType::JudgeInit => "judge-init",
            JobType::Compile => "compile",
            JobType::GenerateInput => "generate-input",
            JobType::Validate => "validate",
            JobType::GenerateOutput => "generate-output",
            JobType::EvaluateCell => "evaluate-cell",
        };
        f.write_str(name)
    }
}

/// The entity a job targets. Everything is keyed by the owning commit plus logical names, resolved
/// by the handlers through the commit state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetRef {
    /// A whole problem commit.
    Problem {
        /// The owning commit.
        commit: CommitId,
    },
    /// A named source file of the commit.
    Source {
        /// The owning commit.
        commit: CommitId,
        /// The kind of the source.
        kind: SourceKind,
        /// The name of the source.
        name: String,
    },
    /// The input artifact of a test case.
    TestCaseInput {
        /// The owning commit.
        commit: CommitId,
        /// The name of the test case.
        testcase: String,
    },
    /// The reference output artifact of a test case.
    TestCaseOutput {
        /// The owning commit.
        commit: CommitId,
        /// The name of the test case.
        testcase: String,
    },
    /// The verdict of a validator on a test case.
    Validation {
        /// The owning commit.
        commit: CommitId,
        /// The name of the validator.
        validator: String,
        /// The name of the test case.
        testcase: String,
    },
    /// One cell of an invocation.
    Cell {
        /// The owning commit.
        commit: CommitId,
        /// The invocation the cell belongs to.
        invocation: InvocationId,
        /// The name of the solution.
        solution: String,
        /// The name of the test case.
        testcase: String,
    },
}

impl TargetRef {
    /// The commit owning the target.
    pub fn commit(&self) -> &CommitId {
        match self {
            TargetRef::Problem { commit } => commit,
            TargetRef::Source { commit, .. } => commit,
            TargetRef::TestCaseInput { commit, .. } => commit,
            TargetRef::TestCaseOutput { commit, .. } => commit,
            TargetRef::Validation { commit, .. } => commit,
            TargetRef::Cell { commit, .. } => commit,
        }
    }
}

impl std::fmt::Display for TargetRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetRef::Problem { commit } => write!(f, "{}", commit),
            TargetRef::Source { commit, kind, name } => {
                write!(f, "{}:{}/{}", commit, kind, name)
            }
            TargetRef::TestCaseInput { commit, testcase } => {
                write!(f, "{}:testcase/{}/input", commit, testcase)
            }
            TargetRef::TestCaseOutput { commit, testcase } => {
                write!(f, "{}:testcase/{}/output", commit, testcase)
            }
            TargetRef::Validation {
                commit,
                validator,
                testcase,
            } => write!(f, "{}:validation/{}/{}", commit, validator, testcase),
            TargetRef::Cell {
                commit,
                invocation,
                solution,
                testcase,
            } => write!(
                f,
                "{}:invocation/{}/{}/{}",
                commit, invocation, solution, testcase
            ),
        }
    }
}

/// The lifecycle state of a job. The progression towards `Finished` is monotonic; a job
/// re-suspended at the dependency check goes back to `Queued` for its next attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobState {
    /// The job exists but has not been published to the queue yet.
    Created,
    /// The job is in the queue, waiting for a worker.
    Queued,
    /// A worker is running the job.
    Running,
    /// The job reached a terminal outcome.
    Finished,
}

/// A scheduler-tracked unit of effectful work targeting one artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// The identifier of the job.
    pub id: JobId,
    /// The kind of effect the job performs.
    pub job_type: JobType,
    /// The entity the job targets.
    pub target: TargetRef,
    /// The lifecycle state.
    pub state: JobState,
    /// The opaque identifier of the job inside the queue broker, if published.
    pub queue_reference: Option<String>,
    /// How many times the job has been re-published after a dependency wait.
    pub attempt_count: u32,
    /// The failure message of a finished job, `None` when the job succeeded or is not terminal.
    pub failure: Option<String>,
}

impl Job {
    /// Make a new job in the `Created` state.
    pub fn new(job_type: JobType, target: TargetRef) -> Job {
        Job {
            id: Uuid::new_v4(),
            job_type,
            target,
            state: JobState::Created,
            queue_reference: None,
            attempt_count: 0,
            failure: None,
        }
    }

    /// Whether the job is waiting in the queue or running on a worker.
    pub fn is_active(&self) -> bool {
        matches!(self.state, JobState::Queued | JobState::Running)
    }
}

/// The observable status of a `(target, job_type)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// The identifier of the tracked job.
    pub id: JobId,
    /// The lifecycle state of the tracked job.
    pub state: JobState,
    /// The terminal outcome, present only when the job is finished.
    pub outcome: Option<JobOutcome>,
}

/// The terminal outcome of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// The job completed its effect.
    Success,
    /// The job failed, with a human readable explanation.
    Failure(String),
}

impl JobStatus {
    /// Whether the job finished successfully.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Some(JobOutcome::Success))
    }

    /// Whether the job finished with a failure.
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, Some(JobOutcome::Failure(_)))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn target() -> TargetRef {
        TargetRef::Source {
            commit: CommitId::new("p", "abcdef"),
            kind: SourceKind::Solution,
            name: "sol.cpp".into(),
        }
    }

    #[test]
    fn test_new_job_is_created() {
        let job = Job::new(JobType::Compile, target());
        assert_eq!(job.state, JobState::Created);
        assert_eq!(job.attempt_count, 0);
        assert!(!job.is_active());
    }

    #[test]
    fn test_active_states() {
        let mut job = Job::new(JobType::Compile, target());
        job.state = JobState::Queued;
        assert!(job.is_active());
        job.state = JobState::Running;
        assert!(job.is_active());
        job.state = JobState::Finished;
        assert!(!job.is_active());
    }

    #[test]
    fn test_state_order() {
        assert!(JobState::Created < JobState::Queued);
        assert!(JobState::Queued < JobState::Running);
        assert!(JobState::Running < JobState::Finished);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(target().to_string(), "p@abcdef:solution/sol.cpp");
    }
}
