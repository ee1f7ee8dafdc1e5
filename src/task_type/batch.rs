use anyhow::{Context, Error};

use taskprep_lang::graders_for;
use taskprep_sandbox::{SandboxFile, SandboxRequest};
use taskprep_store::{CommitId, FileKey, SourceKind};

use crate::context::PipelineContext;
use crate::manifest::ProblemManifest;
use crate::pipeline::to_box_command;
use crate::task_type::{EvaluationResult, TaskType};
use crate::verdict::{verdict_from_exit, JudgeVerdict};

/// The batch task type: the solution reads the input from stdin and writes its output to stdout,
/// compiled together with the graders of its language.
#[derive(Debug, Clone, Copy)]
pub struct Batch;

impl TaskType for Batch {
    fn name(&self) -> &'static str {
        "Batch"
    }

    fn initialize_problem(
        &self,
        _ctx: &PipelineContext,
        _commit: &CommitId,
        manifest: &ProblemManifest,
    ) -> Result<(bool, String), Error> {
        // the manifest is already validated; a batch problem only needs a model solution
        if manifest.solution(&manifest.model_solution).is_none() {
            return Ok((false, "The model solution is missing".into()));
        }
        Ok((true, String::new()))
    }

    fn add_testcase(
        &self,
        _ctx: &PipelineContext,
        _commit: &CommitId,
        manifest: &ProblemManifest,
        testcase: &str,
        _input: &FileKey,
    ) -> Result<(bool, String), Error> {
        if manifest.testcase(testcase).is_none() {
            return Ok((
                false,
                format!("{:?} is not a test case of this revision", testcase),
            ));
        }
        Ok((true, String::new()))
    }

    fn generate_output(
        &self,
        ctx: &PipelineContext,
        commit: &CommitId,
        manifest: &ProblemManifest,
        testcase: &str,
        solution: &str,
    ) -> Result<EvaluationResult, Error> {
        let language = match manifest.language_of(SourceKind::Solution, solution) {
            Some(language) => language,
            None => {
                return Ok(EvaluationResult::failure(
                    JudgeVerdict::InvalidSubmission,
                    "Language not supported",
                ))
            }
        };
        let state = ctx.state(commit)?;
        let (compiled, input) = state.read(|s| {
            (
                s.source(SourceKind::Solution, solution).compiled,
                s.testcase(testcase).input,
            )
        });
        let compiled = match compiled {
            Some(key) => key,
            None => {
                return Ok(EvaluationResult::failure(
                    JudgeVerdict::JudgeFailed,
                    format!("Solution {:?} is not compiled", solution),
                ))
            }
        };
        let input = match input {
            Some(key) => key,
            None => {
                return Ok(EvaluationResult::failure(
                    JudgeVerdict::InvalidTestcase,
                    format!("The input of {:?} is not available", testcase),
                ))
            }
        };
        let compiled = ctx
            .file_store
            .get(&compiled)
            .context("The compiled solution vanished from the store")?;
        let input = ctx
            .file_store
            .get(&input)
            .context("The input artifact vanished from the store")?;

        let graders: Vec<String> = graders_for(language, &manifest.graders)
            .into_iter()
            .cloned()
            .collect();
        let main = language.main_unit(solution, &graders);
        let command = to_box_command(language.execution_command("compiled", main.as_deref()));
        let limits = ctx.solution_limits(manifest);
        let memory_limit = limits.memory;
        let request = SandboxRequest {
            description: format!("Evaluation of {} on testcase {}", solution, testcase),
            commands: vec![command],
            files: vec![SandboxFile::executable("compiled", compiled)],
            stdin: Some(input),
            outputs: vec![],
            limits,
        };
        let outcome = ctx.run_sandbox(request)?;

        let verdict = verdict_from_exit(&outcome.status, outcome.memory, memory_limit);
        let output = if verdict == JudgeVerdict::Ok {
            Some(*outcome.stdout.key())
        } else {
            None
        };
        Ok(EvaluationResult {
            success: !outcome.status.is_sandbox_error(),
            verdict,
            output,
            execution_time: Some(outcome.cpu_time),
            execution_memory: Some(outcome.memory),
            message: outcome.status.to_string(),
        })
    }
}
