use std::sync::Arc;

use anyhow::{bail, Context, Error};

use taskprep_queue::{
    DependencyVerdict, Job, JobCompletion, JobHandler, JobType, Scheduler, TargetRef,
};
use taskprep_store::{CommitId, SourceKind};

use crate::context::PipelineContext;
use crate::manifest::OutputSpec;
use crate::pipeline::{compiled_dep, input_dep, Dep};
use crate::state::StepOutcome;
use crate::task_type;
use crate::verdict::JudgeVerdict;

/// Produces the reference output of a test case: a copy of the uploaded blob for the static ones,
/// the output of the model solution (through the task-type strategy) for the others.
pub(crate) struct GenerateOutputHandler {
    ctx: Arc<PipelineContext>,
}

impl GenerateOutputHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> GenerateOutputHandler {
        GenerateOutputHandler { ctx }
    }

    fn record_failure(&self, commit: &CommitId, testcase: &str, message: &str) {
        let result = self.ctx.state(commit).and_then(|state| {
            state.mutate(|s| {
                let tc = s.testcase_mut(testcase);
                tc.output_gen = StepOutcome::Failed;
                tc.output = None;
                tc.output_message = Some(message.to_string());
            })
        });
        if let Err(e) = result {
            error!(
                "Failed to record the output generation failure of {}: {:?}",
                testcase, e
            );
        }
    }
}

impl JobHandler for GenerateOutputHandler {
    fn validate_dependencies(
        &self,
        _scheduler: &Scheduler,
        job: &Job,
    ) -> Result<DependencyVerdict, Error> {
        let TargetRef::TestCaseOutput { commit, testcase } = &job.target else {
            bail!("Output generation job with an unexpected target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        let spec = match manifest.testcase(testcase) {
            Some(spec) => spec,
            None => {
                return Ok(DependencyVerdict::Failed(format!(
                    "Unknown test case {:?}",
                    testcase
                )))
            }
        };
        if let OutputSpec::Static { .. } = spec.output {
            return Ok(DependencyVerdict::Ready);
        }

        let mut missing = vec![];
        let state = self.ctx.state(commit)?;
        match state.read(|s| s.judge_init) {
            StepOutcome::Ok => {}
            StepOutcome::Pending => missing.push((
                TargetRef::Problem {
                    commit: commit.clone(),
                },
                JobType::JudgeInit,
            )),
            StepOutcome::Failed => {
                let message = state.read(|s| s.judge_init_message.clone());
                return Ok(DependencyVerdict::Failed(format!(
                    "The judge initialization failed: {}",
                    message.as_deref().unwrap_or("unknown reason")
                )));
            }
        }
        match input_dep(&self.ctx, commit, testcase)? {
            Dep::Ready(_) => {}
            Dep::InFlight => missing.push((
                TargetRef::TestCaseInput {
                    commit: commit.clone(),
                    testcase: testcase.clone(),
                },
                JobType::GenerateInput,
            )),
            Dep::Failed(message) => return Ok(DependencyVerdict::Failed(message)),
        }
        match compiled_dep(
            &self.ctx,
            commit,
            SourceKind::Solution,
            &manifest.model_solution,
        )? {
            Dep::Ready(_) => {}
            Dep::InFlight => missing.push((
                TargetRef::Source {
                    commit: commit.clone(),
                    kind: SourceKind::Solution,
                    name: manifest.model_solution.clone(),
                },
                JobType::Compile,
            )),
            Dep::Failed(message) => {
                return Ok(DependencyVerdict::Failed(format!(
                    "The model solution is unusable: {}",
                    message
                )))
            }
        }
        if missing.is_empty() {
            Ok(DependencyVerdict::Ready)
        } else {
            Ok(DependencyVerdict::NotReady { missing })
        }
    }

    fn execute(&self, _scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error> {
        let TargetRef::TestCaseOutput { commit, testcase } = &job.target else {
            bail!("Output generation job with an unexpected target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        let state = self.ctx.state(commit)?;
        let epoch = state.epoch();
        let spec = manifest
            .testcase(testcase)
            .with_context(|| format!("Unknown test case {:?}", testcase))?;

        if let OutputSpec::Static { path } = &spec.output {
            let blob = self
                .ctx
                .snapshot(commit)?
                .blob_at(path)
                .with_context(|| format!("Missing static output at {:?}", path))?;
            let handle = self.ctx.file_store.store_bytes(&blob)?;
            let written = state.commit_if_current(epoch, |s| {
                let tc = s.testcase_mut(testcase);
                tc.output_gen = StepOutcome::Ok;
                tc.output = Some(*handle.key());
                tc.output_message = None;
            })?;
            if written.is_none() {
                debug!("Output of {} discarded: the target was invalidated", testcase);
            }
            return Ok(JobCompletion::Success);
        }

        let task_type = task_type::from_name(&manifest.task_type)
            .with_context(|| format!("Unsupported task type {:?}", manifest.task_type))?;
        let input = match input_dep(&self.ctx, commit, testcase)? {
            Dep::Ready(handle) => handle,
            _ => bail!("The input of {} is no longer available", testcase),
        };
        let (registered, message) =
            task_type.add_testcase(&self.ctx, commit, &manifest, testcase, input.key())?;
        state.commit_if_current(epoch, |s| {
            s.testcase_mut(testcase).judge_init = if registered {
                StepOutcome::Ok
            } else {
                StepOutcome::Failed
            };
        })?;
        if !registered {
            let message = format!("Failed to register {} with the judge: {}", testcase, message);
            self.record_failure(commit, testcase, &message);
            return Ok(JobCompletion::Failure(message));
        }

        let result = task_type.generate_output(
            &self.ctx,
            commit,
            &manifest,
            testcase,
            &manifest.model_solution,
        )?;
        if result.success && result.verdict == JudgeVerdict::Ok {
            let output = result
                .output
                .context("The model solution produced no output artifact")?;
            let written = state.commit_if_current(epoch, |s| {
                let tc = s.testcase_mut(testcase);
                tc.output_gen = StepOutcome::Ok;
                tc.output = Some(output);
                tc.output_message = None;
            })?;
            if written.is_none() {
                debug!("Output of {} discarded: the target was invalidated", testcase);
            }
            Ok(JobCompletion::Success)
        } else {
            let message = format!(
                "The model solution failed on {}: {} ({})",
                testcase, result.verdict, result.message
            );
            self.record_failure(commit, testcase, &message);
            Ok(JobCompletion::Failure(message))
        }
    }

    fn dependency_failed(&self, job: &Job, message: &str) {
        if let TargetRef::TestCaseOutput { commit, testcase } = &job.target {
            self.record_failure(commit, testcase, message);
        }
    }

    fn job_failed(&self, job: &Job, message: &str) {
        self.dependency_failed(job, message);
    }
}
