use std::sync::Arc;

use anyhow::{bail, Error};

use taskprep_queue::{DependencyVerdict, Job, JobCompletion, JobHandler, Scheduler, TargetRef};
use taskprep_store::CommitId;

use crate::context::PipelineContext;
use crate::state::StepOutcome;
use crate::task_type;

/// Initializes the judge for a problem commit through its task-type strategy.
pub(crate) struct JudgeInitHandler {
    ctx: Arc<PipelineContext>,
}

impl JudgeInitHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> JudgeInitHandler {
        JudgeInitHandler { ctx }
    }

    fn record(&self, commit: &CommitId, outcome: StepOutcome, message: &str) {
        let result = self.ctx.state(commit).and_then(|state| {
            state.mutate(|s| {
                s.judge_init = outcome;
                s.judge_init_message = if message.is_empty() {
                    None
                } else {
                    Some(message.to_string())
                };
            })
        });
        if let Err(e) = result {
            error!(
                "Failed to record the judge initialization of {}: {:?}",
                commit, e
            );
        }
    }
}

impl JobHandler for JudgeInitHandler {
    fn validate_dependencies(
        &self,
        _scheduler: &Scheduler,
        _job: &Job,
    ) -> Result<DependencyVerdict, Error> {
        Ok(DependencyVerdict::Ready)
    }

    fn execute(&self, _scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error> {
        let TargetRef::Problem { commit } = &job.target else {
            bail!("Judge init job with an unexpected target {}", job.target);
        };
        let manifest = match self.ctx.manifest(commit) {
            Ok(manifest) => manifest,
            Err(e) => {
                let message = format!("Invalid problem manifest: {}", e);
                self.record(commit, StepOutcome::Failed, &message);
                return Ok(JobCompletion::Failure(message));
            }
        };
        let task_type = match task_type::from_name(&manifest.task_type) {
            Some(task_type) => task_type,
            None => {
                let message = format!("Unsupported task type {:?}", manifest.task_type);
                self.record(commit, StepOutcome::Failed, &message);
                return Ok(JobCompletion::Failure(message));
            }
        };
        let (ok, message) = task_type.initialize_problem(&self.ctx, commit, &manifest)?;
        if ok {
            self.record(commit, StepOutcome::Ok, &message);
            Ok(JobCompletion::Success)
        } else {
            self.record(commit, StepOutcome::Failed, &message);
            Ok(JobCompletion::Failure(message))
        }
    }

    fn dependency_failed(&self, job: &Job, message: &str) {
        if let TargetRef::Problem { commit } = &job.target {
            self.record(commit, StepOutcome::Failed, message);
        }
    }

    fn job_failed(&self, job: &Job, message: &str) {
        self.dependency_failed(job, message);
    }
}
