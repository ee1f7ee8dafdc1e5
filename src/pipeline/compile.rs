use std::sync::Arc;

use anyhow::{bail, Error};

use taskprep_lang::{compilation_order, graders_for};
use taskprep_queue::{DependencyVerdict, Job, JobCompletion, JobHandler, Scheduler, TargetRef};
use taskprep_sandbox::{ExitStatus, SandboxFile, SandboxRequest};
use taskprep_store::{ArtifactDescriptor, CommitId, SourceKind};

use crate::context::PipelineContext;
use crate::pipeline::{fetch_source, to_box_command};
use crate::state::StepOutcome;

/// The name of the compiled artifact inside the sandbox.
const COMPILED_NAME: &str = "compiled";

/// Produces the compiled artifact of a named source, with the shared resource files in the
/// sandbox and, for the solutions, the graders of the language.
pub(crate) struct CompileHandler {
    ctx: Arc<PipelineContext>,
}

impl CompileHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> CompileHandler {
        CompileHandler { ctx }
    }

    fn record_failure(&self, commit: &CommitId, kind: SourceKind, name: &str, message: &str) {
        let result = self.ctx.state(commit).and_then(|state| {
            state.mutate(|s| {
                let source = s.source_mut(kind, name);
                source.compilation = StepOutcome::Failed;
                source.message = Some(message.to_string());
            })
        });
        if let Err(e) = result {
            error!("Failed to record the compilation failure of {}: {:?}", name, e);
        }
    }
}

impl JobHandler for CompileHandler {
    fn validate_dependencies(
        &self,
        _scheduler: &Scheduler,
        _job: &Job,
    ) -> Result<DependencyVerdict, Error> {
        // the sources come straight from the snapshot
        Ok(DependencyVerdict::Ready)
    }

    fn execute(&self, _scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error> {
        let TargetRef::Source { commit, kind, name } = &job.target else {
            bail!("Compile job with a non-source target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        let state = self.ctx.state(commit)?;
        let epoch = state.epoch();

        let language = match manifest.language_of(*kind, name) {
            Some(language) => language,
            None => {
                let message = format!("Unsupported language for {:?}", name);
                self.record_failure(commit, *kind, name, &message);
                return Ok(JobCompletion::Failure(message));
            }
        };

        let mut files = vec![SandboxFile::read(
            name.as_str(),
            fetch_source(&self.ctx, commit, *kind, name)?,
        )];
        for resource in &manifest.resources {
            files.push(SandboxFile::read(
                resource.as_str(),
                fetch_source(&self.ctx, commit, SourceKind::Resource, resource)?,
            ));
        }
        let sources = if *kind == SourceKind::Solution {
            let graders: Vec<String> = graders_for(language, &manifest.graders)
                .into_iter()
                .cloned()
                .collect();
            for grader in &graders {
                files.push(SandboxFile::read(
                    grader.as_str(),
                    fetch_source(&self.ctx, commit, SourceKind::Grader, grader)?,
                ));
            }
            compilation_order(language, name, &graders)
        } else {
            vec![name.clone()]
        };

        let commands = language
            .compilation_commands(&sources, COMPILED_NAME)
            .into_iter()
            .map(to_box_command)
            .collect();
        let request = SandboxRequest {
            description: format!("Compilation of {}", name),
            commands,
            files,
            stdin: None,
            outputs: vec![COMPILED_NAME.to_string()],
            limits: self.ctx.compile_limits(),
        };
        let outcome = self.ctx.run_sandbox(request)?;
        let log = format!("{}{}", outcome.stdout_content(), outcome.stderr_content());

        if let ExitStatus::SandboxError(diagnostic) = &outcome.status {
            // a sandbox fault is not a compiler verdict: the compilation outcome stays open
            return Ok(JobCompletion::Failure(format!(
                "Sandbox failed during the compilation of {}: {}",
                name, diagnostic
            )));
        }

        if outcome.status.is_ok() {
            let Some(binary) = outcome.outputs.get(COMPILED_NAME) else {
                let message = format!("The compiler produced no output for {:?}", name);
                self.record_failure(commit, *kind, name, &message);
                return Ok(JobCompletion::Failure(message));
            };
            let written = state.commit_if_current(epoch, |s| {
                let source = s.source_mut(*kind, name);
                source.compilation = StepOutcome::Ok;
                source.compiled = Some(*binary.key());
                source.compile_log = Some(log.clone());
                source.message = None;
            })?;
            if written.is_none() {
                debug!("Compilation of {} discarded: the target was invalidated", name);
                return Ok(JobCompletion::Success);
            }
            self.ctx.commit_store.write_descriptor(
                commit,
                *kind,
                &ArtifactDescriptor {
                    name: name.clone(),
                    file: *binary.key(),
                },
            )?;
            Ok(JobCompletion::Success)
        } else {
            let message = format!("Compilation of {} failed: {}", name, outcome.status);
            state.commit_if_current(epoch, |s| {
                let source = s.source_mut(*kind, name);
                source.compilation = StepOutcome::Failed;
                source.compiled = None;
                source.compile_log = Some(log.clone());
                source.message = Some(message.clone());
            })?;
            Ok(JobCompletion::Failure(message))
        }
    }

    fn dependency_failed(&self, job: &Job, message: &str) {
        if let TargetRef::Source { commit, kind, name } = &job.target {
            self.record_failure(commit, *kind, name, message);
        }
    }

    fn job_failed(&self, job: &Job, message: &str) {
        if let TargetRef::Source { commit, kind, name } = &job.target {
            self.record_failure(commit, *kind, name, message);
        }
    }
}
