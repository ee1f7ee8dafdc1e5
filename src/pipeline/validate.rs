use std::sync::Arc;

use anyhow::{bail, Error};

use taskprep_queue::{
    DependencyVerdict, Job, JobCompletion, JobHandler, JobType, Scheduler, TargetRef,
};
use taskprep_sandbox::{ExitStatus, SandboxFile, SandboxRequest};
use taskprep_store::{CommitId, SourceKind};

use crate::context::PipelineContext;
use crate::pipeline::checker::first_line;
use crate::pipeline::{compiled_dep, input_dep, to_box_command, Dep};
use crate::state::ValidationState;

/// The name of the input file inside the validator sandbox.
const INPUT_NAME: &str = "input.txt";

/// Runs a compiled validator against the generated input of a test case and records the boolean
/// verdict with the first line of the validator's standard error as message.
pub(crate) struct ValidateHandler {
    ctx: Arc<PipelineContext>,
}

impl ValidateHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> ValidateHandler {
        ValidateHandler { ctx }
    }

    fn record(&self, commit: &CommitId, validator: &str, testcase: &str, state: ValidationState) {
        let result = self.ctx.state(commit).and_then(|db| {
            db.mutate(|s| {
                s.validations
                    .insert((validator.to_string(), testcase.to_string()), state);
            })
        });
        if let Err(e) = result {
            error!(
                "Failed to record the validation of {} by {}: {:?}",
                testcase, validator, e
            );
        }
    }
}

impl JobHandler for ValidateHandler {
    fn validate_dependencies(
        &self,
        _scheduler: &Scheduler,
        job: &Job,
    ) -> Result<DependencyVerdict, Error> {
        let TargetRef::Validation {
            commit,
            validator,
            testcase,
        } = &job.target
        else {
            bail!("Validation job with an unexpected target {}", job.target);
        };
        let mut missing = vec![];
        match compiled_dep(&self.ctx, commit, SourceKind::Validator, validator)? {
            Dep::Ready(_) => {}
            Dep::InFlight => missing.push((
                TargetRef::Source {
                    commit: commit.clone(),
                    kind: SourceKind::Validator,
                    name: validator.clone(),
                },
                JobType::Compile,
            )),
            Dep::Failed(_) => {
                return Ok(DependencyVerdict::Failed(format!(
                    "Validation failed: validator {:?} didn't compile",
                    validator
                )))
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
        if missing.is_empty() {
            Ok(DependencyVerdict::Ready)
        } else {
            Ok(DependencyVerdict::NotReady { missing })
        }
    }

    fn execute(&self, _scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error> {
        let TargetRef::Validation {
            commit,
            validator,
            testcase,
        } = &job.target
        else {
            bail!("Validation job with an unexpected target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        let compiled = match compiled_dep(&self.ctx, commit, SourceKind::Validator, validator)? {
            Dep::Ready(handle) => handle,
            _ => bail!("The validator {} is no longer compiled", validator),
        };
        let input = match input_dep(&self.ctx, commit, testcase)? {
            Dep::Ready(handle) => handle,
            _ => bail!("The input of {} is no longer available", testcase),
        };
        let language = match manifest.language_of(SourceKind::Validator, validator) {
            Some(language) => language,
            None => bail!("Unsupported validator language for {:?}", validator),
        };
        let main = language.main_unit(validator, &[]);
        let mut command_line = language.execution_command("validator", main.as_deref());
        command_line.push(INPUT_NAME.to_string());
        let request = SandboxRequest {
            description: format!("Validation of {} by {}", testcase, validator),
            commands: vec![to_box_command(command_line)],
            files: vec![
                SandboxFile::executable("validator", compiled),
                SandboxFile::read(INPUT_NAME, input),
            ],
            stdin: None,
            outputs: vec![],
            limits: self.ctx.generator_limits(),
        };
        let outcome = self.ctx.run_sandbox(request)?;
        match &outcome.status {
            ExitStatus::Ok => {
                let message = first_line(&outcome.stderr_content());
                self.record(
                    commit,
                    validator,
                    testcase,
                    ValidationState::Valid { message },
                );
                Ok(JobCompletion::Success)
            }
            ExitStatus::SandboxError(diagnostic) => {
                self.record(
                    commit,
                    validator,
                    testcase,
                    ValidationState::Invalid {
                        message: "Validation failed due to system error".into(),
                    },
                );
                Ok(JobCompletion::Failure(format!(
                    "Sandbox failed during the validation of {}: {}",
                    testcase, diagnostic
                )))
            }
            status => {
                let stderr = first_line(&outcome.stderr_content());
                let message = if stderr.is_empty() {
                    status.to_string()
                } else {
                    stderr
                };
                self.record(
                    commit,
                    validator,
                    testcase,
                    ValidationState::Invalid { message },
                );
                Ok(JobCompletion::Success)
            }
        }
    }

    fn dependency_failed(&self, job: &Job, message: &str) {
        if let TargetRef::Validation {
            commit,
            validator,
            testcase,
        } = &job.target
        {
            self.record(
                commit,
                validator,
                testcase,
                ValidationState::Invalid {
                    message: message.to_string(),
                },
            );
        }
    }

    fn job_failed(&self, job: &Job, message: &str) {
        self.dependency_failed(job, message);
    }
}
