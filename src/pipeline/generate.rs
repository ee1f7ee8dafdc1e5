use std::sync::Arc;

use anyhow::{bail, Context, Error};

use taskprep_queue::{
    DependencyVerdict, Job, JobCompletion, JobHandler, JobType, Scheduler, TargetRef,
};
use taskprep_sandbox::{ExitStatus, SandboxFile, SandboxRequest};
use taskprep_store::{CommitId, FileKey, SourceKind};

use crate::context::PipelineContext;
use crate::manifest::InputSpec;
use crate::pipeline::{compiled_dep, to_box_command, Dep};
use crate::state::StepOutcome;

/// Produces the input artifact of a test case: a copy of the uploaded blob for the static ones,
/// the captured stdout of the generator for the others. A fresh input fans out one validation job
/// per applicable validator.
pub(crate) struct GenerateInputHandler {
    ctx: Arc<PipelineContext>,
}

impl GenerateInputHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> GenerateInputHandler {
        GenerateInputHandler { ctx }
    }

    fn record_failure(&self, commit: &CommitId, testcase: &str, message: &str) {
        let result = self.ctx.state(commit).and_then(|state| {
            state.mutate(|s| {
                let tc = s.testcase_mut(testcase);
                tc.input_gen = StepOutcome::Failed;
                tc.input = None;
                tc.input_message = Some(message.to_string());
            })
        });
        if let Err(e) = result {
            error!(
                "Failed to record the input generation failure of {}: {:?}",
                testcase, e
            );
        }
    }

    /// Publish the input artifact, unless the test case was invalidated in the meantime, and fan
    /// out the validations.
    fn publish_input(
        &self,
        scheduler: &Scheduler,
        commit: &CommitId,
        testcase: &str,
        epoch: u64,
        input: FileKey,
    ) -> Result<JobCompletion, Error> {
        let state = self.ctx.state(commit)?;
        let written = state.commit_if_current(epoch, |s| {
            let tc = s.testcase_mut(testcase);
            tc.input_gen = StepOutcome::Ok;
            tc.input = Some(input);
            tc.input_message = None;
        })?;
        if written.is_none() {
            debug!(
                "Input of {} discarded: the target was invalidated",
                testcase
            );
            return Ok(JobCompletion::Success);
        }
        let manifest = self.ctx.manifest(commit)?;
        for validator in manifest.validators_for(testcase) {
            scheduler.request(
                TargetRef::Validation {
                    commit: commit.clone(),
                    validator: validator.name.clone(),
                    testcase: testcase.to_string(),
                },
                JobType::Validate,
            )?;
        }
        Ok(JobCompletion::Success)
    }
}

impl JobHandler for GenerateInputHandler {
    fn validate_dependencies(
        &self,
        _scheduler: &Scheduler,
        job: &Job,
    ) -> Result<DependencyVerdict, Error> {
        let TargetRef::TestCaseInput { commit, testcase } = &job.target else {
            bail!("Input generation job with an unexpected target {}", job.target);
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
        match &spec.input {
            InputSpec::Static { .. } => Ok(DependencyVerdict::Ready),
            InputSpec::Generated { generator, .. } => {
                match compiled_dep(&self.ctx, commit, SourceKind::InputGenerator, generator)? {
                    Dep::Ready(_) => Ok(DependencyVerdict::Ready),
                    Dep::InFlight => Ok(DependencyVerdict::NotReady {
                        missing: vec![(
                            TargetRef::Source {
                                commit: commit.clone(),
                                kind: SourceKind::InputGenerator,
                                name: generator.clone(),
                            },
                            JobType::Compile,
                        )],
                    }),
                    Dep::Failed(message) => Ok(DependencyVerdict::Failed(message)),
                }
            }
        }
    }

    fn execute(&self, scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error> {
        let TargetRef::TestCaseInput { commit, testcase } = &job.target else {
            bail!("Input generation job with an unexpected target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        let state = self.ctx.state(commit)?;
        let epoch = state.epoch();
        let spec = manifest
            .testcase(testcase)
            .with_context(|| format!("Unknown test case {:?}", testcase))?;

        match &spec.input {
            InputSpec::Static { path } => {
                let blob = self
                    .ctx
                    .snapshot(commit)?
                    .blob_at(path)
                    .with_context(|| format!("Missing static input at {:?}", path))?;
                let handle = self.ctx.file_store.store_bytes(&blob)?;
                self.publish_input(scheduler, commit, testcase, epoch, *handle.key())
            }
            InputSpec::Generated { generator, args } => {
                let compiled = match compiled_dep(
                    &self.ctx,
                    commit,
                    SourceKind::InputGenerator,
                    generator,
                )? {
                    Dep::Ready(handle) => handle,
                    // invalidated between the dependency check and now
                    _ => bail!("The generator {} is no longer compiled", generator),
                };
                let arg_tokens = match shell_words::split(args) {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        let message = format!("Invalid generator arguments {:?}: {}", args, e);
                        self.record_failure(commit, testcase, &message);
                        return Ok(JobCompletion::Failure(message));
                    }
                };
                let language = manifest
                    .language_of(SourceKind::InputGenerator, generator)
                    .with_context(|| format!("Unsupported generator language for {:?}", generator))?;
                let main = language.main_unit(generator, &[]);
                let mut command_line = language.execution_command("generator", main.as_deref());
                command_line.extend(arg_tokens);
                let request = SandboxRequest {
                    description: format!("Generation of input of testcase {}", testcase),
                    commands: vec![to_box_command(command_line)],
                    files: vec![SandboxFile::executable("generator", compiled)],
                    stdin: None,
                    outputs: vec![],
                    limits: self.ctx.generator_limits(),
                };
                let outcome = self.ctx.run_sandbox(request)?;
                match &outcome.status {
                    ExitStatus::Ok => {
                        let input = *outcome.stdout.key();
                        self.publish_input(scheduler, commit, testcase, epoch, input)
                    }
                    status => {
                        let message = format!(
                            "Generator of {} failed: {}\n{}",
                            testcase,
                            status,
                            outcome.stderr_content()
                        );
                        self.record_failure(commit, testcase, &message);
                        Ok(JobCompletion::Failure(message))
                    }
                }
            }
        }
    }

    fn dependency_failed(&self, job: &Job, message: &str) {
        if let TargetRef::TestCaseInput { commit, testcase } = &job.target {
            self.record_failure(commit, testcase, message);
        }
    }

    fn job_failed(&self, job: &Job, message: &str) {
        if let TargetRef::TestCaseInput { commit, testcase } = &job.target {
            self.record_failure(commit, testcase, message);
        }
    }
}
