use std::sync::Arc;

use anyhow::{bail, Error};

use taskprep_queue::{
    DependencyVerdict, InvocationId, Job, JobCompletion, JobHandler, JobType, Scheduler, TargetRef,
};
use taskprep_store::SourceKind;

use crate::context::PipelineContext;
use crate::invocation::CellResult;
use crate::pipeline::checker::run_checker;
use crate::pipeline::{compiled_dep, input_dep, output_dep, Dep};
use crate::state::StepOutcome;
use crate::task_type;
use crate::verdict::JudgeVerdict;

/// Judges one (invocation, solution, test case) cell: runs the solution through the task type,
/// then scores its output with the checker. Dependency failures terminate the cell with the
/// corresponding verdict instead of a generic failure.
pub(crate) struct EvaluateCellHandler {
    ctx: Arc<PipelineContext>,
}

impl EvaluateCellHandler {
    pub fn new(ctx: Arc<PipelineContext>) -> EvaluateCellHandler {
        EvaluateCellHandler { ctx }
    }

    fn record(
        &self,
        invocation: InvocationId,
        solution: &str,
        testcase: &str,
        result: CellResult,
    ) {
        if let Err(e) = self
            .ctx
            .invocations
            .record_result(invocation, solution, testcase, result)
        {
            error!(
                "Failed to record the result of cell ({}, {}): {:?}",
                solution, testcase, e
            );
        }
    }
}

impl JobHandler for EvaluateCellHandler {
    fn validate_dependencies(
        &self,
        _scheduler: &Scheduler,
        job: &Job,
    ) -> Result<DependencyVerdict, Error> {
        let TargetRef::Cell {
            commit,
            solution,
            testcase,
            ..
        } = &job.target
        else {
            bail!("Cell job with an unexpected target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        if manifest.solution(solution).is_none() {
            return Ok(DependencyVerdict::Failed(format!(
                "Unknown solution {:?}",
                solution
            )));
        }
        // an unsupported language resolves directly to invalid_submission, skipping compilation
        if manifest
            .language_of(SourceKind::Solution, solution)
            .is_none()
        {
            return Ok(DependencyVerdict::Ready);
        }

        // terminal failures of the prerequisites are cell verdicts, decided by execute: only the
        // in-flight ones suspend the job
        let mut missing = vec![];
        if let Dep::InFlight = compiled_dep(&self.ctx, commit, SourceKind::Solution, solution)? {
            missing.push((
                TargetRef::Source {
                    commit: commit.clone(),
                    kind: SourceKind::Solution,
                    name: solution.clone(),
                },
                JobType::Compile,
            ));
        }
        if let Some(checker) = &manifest.checker {
            if let Dep::InFlight = compiled_dep(&self.ctx, commit, SourceKind::Checker, checker)? {
                missing.push((
                    TargetRef::Source {
                        commit: commit.clone(),
                        kind: SourceKind::Checker,
                        name: checker.clone(),
                    },
                    JobType::Compile,
                ));
            }
        }
        if let Dep::InFlight = input_dep(&self.ctx, commit, testcase)? {
            missing.push((
                TargetRef::TestCaseInput {
                    commit: commit.clone(),
                    testcase: testcase.clone(),
                },
                JobType::GenerateInput,
            ));
        }
        if let Dep::InFlight = output_dep(&self.ctx, commit, testcase)? {
            missing.push((
                TargetRef::TestCaseOutput {
                    commit: commit.clone(),
                    testcase: testcase.clone(),
                },
                JobType::GenerateOutput,
            ));
        }
        let state = self.ctx.state(commit)?;
        if state.read(|s| s.judge_init) == StepOutcome::Pending {
            missing.push((
                TargetRef::Problem {
                    commit: commit.clone(),
                },
                JobType::JudgeInit,
            ));
        }
        if missing.is_empty() {
            Ok(DependencyVerdict::Ready)
        } else {
            Ok(DependencyVerdict::NotReady { missing })
        }
    }

    fn execute(&self, _scheduler: &Scheduler, job: &Job) -> Result<JobCompletion, Error> {
        let TargetRef::Cell {
            commit,
            invocation,
            solution,
            testcase,
        } = &job.target
        else {
            bail!("Cell job with an unexpected target {}", job.target);
        };
        let manifest = self.ctx.manifest(commit)?;
        self.ctx
            .invocations
            .set_judging(*invocation, solution, testcase)?;

        if manifest
            .language_of(SourceKind::Solution, solution)
            .is_none()
        {
            self.record(
                *invocation,
                solution,
                testcase,
                CellResult::of_verdict(JudgeVerdict::InvalidSubmission, "Language not supported"),
            );
            return Ok(JobCompletion::Success);
        }

        // the dependency check passed, so every prerequisite is terminal: map the failed ones to
        // their cell verdicts
        match compiled_dep(&self.ctx, commit, SourceKind::Solution, solution)? {
            Dep::Ready(_) => {}
            Dep::InFlight => bail!("The solution {} is no longer compiled", solution),
            Dep::Failed(_) => {
                let state = self.ctx.state(commit)?;
                let log = state.read(|s| {
                    s.source(SourceKind::Solution, solution)
                        .compile_log
                        .unwrap_or_default()
                });
                self.record(
                    *invocation,
                    solution,
                    testcase,
                    CellResult::of_verdict(
                        JudgeVerdict::CompilationFailed,
                        format!("Compilation not successful\n{}", log),
                    ),
                );
                return Ok(JobCompletion::Success);
            }
        }
        let input = match input_dep(&self.ctx, commit, testcase)? {
            Dep::Ready(handle) => handle,
            Dep::InFlight => bail!("The input of {} is no longer available", testcase),
            Dep::Failed(message) => {
                self.record(
                    *invocation,
                    solution,
                    testcase,
                    CellResult::of_verdict(JudgeVerdict::InvalidTestcase, message),
                );
                return Ok(JobCompletion::Success);
            }
        };
        let correct = match output_dep(&self.ctx, commit, testcase)? {
            Dep::Ready(handle) => handle,
            Dep::InFlight => bail!("The output of {} is no longer available", testcase),
            Dep::Failed(message) => {
                self.record(
                    *invocation,
                    solution,
                    testcase,
                    CellResult::of_verdict(JudgeVerdict::InvalidTestcase, message),
                );
                return Ok(JobCompletion::Success);
            }
        };
        let state = self.ctx.state(commit)?;
        if state.read(|s| s.judge_init) == StepOutcome::Failed {
            let message = state.read(|s| s.judge_init_message.clone());
            self.record(
                *invocation,
                solution,
                testcase,
                CellResult::of_verdict(
                    JudgeVerdict::JudgeFailed,
                    format!(
                        "The judge initialization failed: {}",
                        message.as_deref().unwrap_or("unknown reason")
                    ),
                ),
            );
            return Ok(JobCompletion::Success);
        }
        if let Some(checker) = &manifest.checker {
            if let Dep::Failed(message) =
                compiled_dep(&self.ctx, commit, SourceKind::Checker, checker)?
            {
                self.record(
                    *invocation,
                    solution,
                    testcase,
                    CellResult::of_verdict(JudgeVerdict::CheckerFailed, message),
                );
                return Ok(JobCompletion::Success);
            }
        }

        let task_type = match task_type::from_name(&manifest.task_type) {
            Some(task_type) => task_type,
            None => {
                self.record(
                    *invocation,
                    solution,
                    testcase,
                    CellResult::of_verdict(
                        JudgeVerdict::JudgeFailed,
                        format!("Unsupported task type {:?}", manifest.task_type),
                    ),
                );
                return Ok(JobCompletion::Success);
            }
        };
        let run = task_type.generate_output(&self.ctx, commit, &manifest, testcase, solution)?;
        if run.verdict != JudgeVerdict::Ok {
            self.record(
                *invocation,
                solution,
                testcase,
                CellResult {
                    verdict: run.verdict,
                    score: None,
                    execution_time: run.execution_time,
                    execution_memory: run.execution_memory,
                    contestant_message: None,
                    checker_stdout: None,
                    checker_stderr: None,
                    message: Some(run.message),
                },
            );
            return Ok(JobCompletion::Success);
        }
        let candidate = match run.output {
            Some(output) => output,
            None => bail!("A successful run produced no output artifact"),
        };
        let check = run_checker(&self.ctx, commit, &manifest, &input, &correct, &candidate)?;
        self.record(
            *invocation,
            solution,
            testcase,
            CellResult {
                verdict: check.verdict,
                score: check.score,
                execution_time: run.execution_time,
                execution_memory: run.execution_memory,
                contestant_message: check.contestant_message,
                checker_stdout: check.checker_stdout,
                checker_stderr: check.checker_stderr,
                message: if check.message.is_empty() {
                    None
                } else {
                    Some(check.message)
                },
            },
        );
        Ok(JobCompletion::Success)
    }

    fn dependency_failed(&self, job: &Job, message: &str) {
        if let TargetRef::Cell {
            invocation,
            solution,
            testcase,
            ..
        } = &job.target
        {
            self.record(
                *invocation,
                solution,
                testcase,
                CellResult::of_verdict(JudgeVerdict::JudgeFailed, message),
            );
        }
    }

    fn job_failed(&self, job: &Job, message: &str) {
        self.dependency_failed(job, message);
    }
}
