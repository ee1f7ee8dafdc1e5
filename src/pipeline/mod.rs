//! The job handlers of the six pipeline operations and the [`Pipeline`] facade tying the
//! scheduler, the stores and the handlers together.

mod checker;
mod compile;
mod evaluate;
mod generate;
mod judge_init;
mod outputs;
mod validate;

pub use checker::{parse_checker_score, white_diff};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Error};

use taskprep_queue::{
    InvocationId, JobHandler, JobId, JobState, JobStatus, JobType, QueueError, Scheduler,
    SchedulerConfig, TargetRef, WorkerPool,
};
use taskprep_sandbox::{BoxCommand, SandboxCommand, SandboxRunner};
use taskprep_store::{CommitId, FileHandle, SourceKind, StateFile};

use crate::context::PipelineContext;
use crate::invocation::Invocation;
use crate::snapshot::SnapshotProvider;
use crate::state::{StepOutcome, StepState};

/// The outcome of checking one prerequisite of a job.
pub(crate) enum Dep<T> {
    /// The prerequisite is in a terminal success state.
    Ready(T),
    /// The prerequisite has not reached a terminal state yet.
    InFlight,
    /// The prerequisite is in a terminal failure state.
    Failed(String),
}

/// Check the compilation of a source as a prerequisite.
pub(crate) fn compiled_dep(
    ctx: &PipelineContext,
    commit: &CommitId,
    kind: SourceKind,
    name: &str,
) -> Result<Dep<FileHandle>, Error> {
    let state = ctx.state(commit)?;
    let source = state.read(|s| s.source(kind, name));
    match source.compilation {
        StepOutcome::Ok => {
            let key = source
                .compiled
                .context("Compilation marked ok without an artifact")?;
            let handle = ctx
                .file_store
                .get(&key)
                .context("The compiled artifact vanished from the store")?;
            Ok(Dep::Ready(handle))
        }
        StepOutcome::Failed => Ok(Dep::Failed(format!(
            "{} {} failed to compile: {}",
            kind,
            name,
            source.message.as_deref().unwrap_or("unknown reason")
        ))),
        StepOutcome::Pending => Ok(Dep::InFlight),
    }
}

/// Check the input artifact of a test case as a prerequisite.
pub(crate) fn input_dep(
    ctx: &PipelineContext,
    commit: &CommitId,
    testcase: &str,
) -> Result<Dep<FileHandle>, Error> {
    let state = ctx.state(commit)?;
    let tc = state.read(|s| s.testcase(testcase));
    match tc.input_gen {
        StepOutcome::Ok => {
            let key = tc
                .input
                .context("Input generation marked ok without an artifact")?;
            let handle = ctx
                .file_store
                .get(&key)
                .context("The input artifact vanished from the store")?;
            Ok(Dep::Ready(handle))
        }
        StepOutcome::Failed => Ok(Dep::Failed(format!(
            "The input of {} failed to generate: {}",
            testcase,
            tc.input_message.as_deref().unwrap_or("unknown reason")
        ))),
        StepOutcome::Pending => Ok(Dep::InFlight),
    }
}

/// Check the reference output of a test case as a prerequisite.
pub(crate) fn output_dep(
    ctx: &PipelineContext,
    commit: &CommitId,
    testcase: &str,
) -> Result<Dep<FileHandle>, Error> {
    let state = ctx.state(commit)?;
    let tc = state.read(|s| s.testcase(testcase));
    match tc.output_gen {
        StepOutcome::Ok => {
            let key = tc
                .output
                .context("Output generation marked ok without an artifact")?;
            let handle = ctx
                .file_store
                .get(&key)
                .context("The output artifact vanished from the store")?;
            Ok(Dep::Ready(handle))
        }
        StepOutcome::Failed => Ok(Dep::Failed(format!(
            "The output of {} failed to generate: {}",
            testcase,
            tc.output_message.as_deref().unwrap_or("unknown reason")
        ))),
        StepOutcome::Pending => Ok(Dep::InFlight),
    }
}

/// Fetch a named source from the snapshot of a commit and publish it to the file store.
pub(crate) fn fetch_source(
    ctx: &PipelineContext,
    commit: &CommitId,
    kind: SourceKind,
    name: &str,
) -> Result<FileHandle, Error> {
    let snapshot = ctx.snapshot(commit)?;
    let path = format!("{}/{}", kind.dir_name(), name);
    let blob = snapshot
        .blob_at(&path)
        .with_context(|| format!("The snapshot has no {} named {:?}", kind, name))?;
    ctx.file_store.store_bytes(&blob)
}

/// Turn a command line of the language table into a sandbox command: a leading `./` means a
/// program local to the sandbox, anything else is searched in the system path.
pub(crate) fn to_box_command(mut command_line: Vec<String>) -> SandboxCommand {
    let program = if command_line.is_empty() {
        String::new()
    } else {
        command_line.remove(0)
    };
    let command = match program.strip_prefix("./") {
        Some(local) => BoxCommand::local(local),
        None => BoxCommand::system(program),
    };
    SandboxCommand::new(command, command_line)
}

/// The configuration of a [`Pipeline`].
pub struct PipelineConfig {
    /// The directory holding the stores, the job table and the sandboxes.
    pub store_dir: PathBuf,
    /// How many workers consume the job queue.
    pub workers: usize,
    /// How many sandbox box ids are available.
    pub num_boxes: u32,
    /// The retry policy of the scheduler.
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    /// A configuration with the default policies.
    pub fn new<P: Into<PathBuf>>(store_dir: P) -> PipelineConfig {
        PipelineConfig {
            store_dir: store_dir.into(),
            workers: num_cpus::get(),
            num_boxes: 64,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// The user-facing facade of the preparation pipeline.
///
/// Owns the shared context, the scheduler with its six registered handlers, and the worker pool.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    scheduler: Arc<Scheduler>,
    pool: Option<WorkerPool>,
}

impl Pipeline {
    /// Start a pipeline: open the stores, register the handlers, start the workers and recover
    /// the jobs left over by a previous run.
    pub fn start(
        config: PipelineConfig,
        snapshots: Box<dyn SnapshotProvider>,
        runner: Arc<dyn SandboxRunner>,
    ) -> Result<Pipeline, Error> {
        let ctx = Arc::new(PipelineContext::new(
            &config.store_dir,
            snapshots,
            runner,
            config.num_boxes,
        )?);
        let mut handlers: HashMap<JobType, Box<dyn JobHandler>> = HashMap::new();
        handlers.insert(
            JobType::JudgeInit,
            Box::new(judge_init::JudgeInitHandler::new(ctx.clone())),
        );
        handlers.insert(
            JobType::Compile,
            Box::new(compile::CompileHandler::new(ctx.clone())),
        );
        handlers.insert(
            JobType::GenerateInput,
            Box::new(generate::GenerateInputHandler::new(ctx.clone())),
        );
        handlers.insert(
            JobType::Validate,
            Box::new(validate::ValidateHandler::new(ctx.clone())),
        );
        handlers.insert(
            JobType::GenerateOutput,
            Box::new(outputs::GenerateOutputHandler::new(ctx.clone())),
        );
        handlers.insert(
            JobType::EvaluateCell,
            Box::new(evaluate::EvaluateCellHandler::new(ctx.clone())),
        );
        let state_file = StateFile::new(config.store_dir.join("jobs.bin"));
        let (scheduler, receiver) = Scheduler::new(state_file, handlers, config.scheduler)?;
        let scheduler = Arc::new(scheduler);
        let pool = WorkerPool::start(scheduler.clone(), receiver, config.workers);
        scheduler.recover()?;
        Ok(Pipeline {
            ctx,
            scheduler,
            pool: Some(pool),
        })
    }

    /// The shared context of the handlers.
    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Ensure a job is active for the pair. See [`Scheduler::request`].
    pub fn request(&self, target: TargetRef, job_type: JobType) -> Result<JobId, QueueError> {
        self.scheduler.request(target, job_type)
    }

    /// The status of the pair. See [`Scheduler::status`].
    pub fn status(&self, target: &TargetRef, job_type: JobType) -> Option<JobStatus> {
        self.scheduler.status(target, job_type)
    }

    /// The full compilation state of a source, combining the persisted outcome with the state of
    /// the active job, if any.
    pub fn compilation_state(
        &self,
        commit: &CommitId,
        kind: SourceKind,
        name: &str,
    ) -> Result<StepState, Error> {
        let state = self.ctx.state(commit)?;
        let outcome = state.read(|s| s.source(kind, name).compilation);
        Ok(match outcome {
            StepOutcome::Ok => StepState::Ok,
            StepOutcome::Failed => StepState::Failed,
            StepOutcome::Pending => {
                let target = TargetRef::Source {
                    commit: commit.clone(),
                    kind,
                    name: name.to_string(),
                };
                match self.scheduler.status(&target, JobType::Compile) {
                    Some(status) if status.state == JobState::Running => StepState::Running,
                    Some(status) if status.state != JobState::Finished => StepState::Queued,
                    _ => StepState::None,
                }
            }
        })
    }

    /// Wait for the pair to reach a terminal state. See [`Scheduler::wait`].
    pub fn wait(
        &self,
        target: &TargetRef,
        job_type: JobType,
        timeout: Duration,
    ) -> Option<JobStatus> {
        self.scheduler.wait(target, job_type, timeout)
    }

    /// Mark the artifacts of the target and of every transitive dependent stale, atomically.
    /// Active jobs run to completion but their outputs are discarded at commit time.
    pub fn invalidate(&self, target: &TargetRef) -> Result<(), Error> {
        let manifest = self.ctx.manifest(target.commit())?;
        self.ctx
            .state(target.commit())?
            .invalidate(target, &manifest)
    }

    /// Create an invocation for some solutions and test cases of a commit.
    pub fn create_invocation(
        &self,
        commit: &CommitId,
        solutions: Vec<String>,
        testcases: Vec<String>,
    ) -> Result<InvocationId, Error> {
        let manifest = self.ctx.manifest(commit)?;
        for solution in &solutions {
            if manifest.solution(solution).is_none() {
                bail!("Unknown solution {:?}", solution);
            }
        }
        for testcase in &testcases {
            if manifest.testcase(testcase).is_none() {
                bail!("Unknown test case {:?}", testcase);
            }
        }
        self.ctx.invocations.create(commit.clone(), solutions, testcases)
    }

    /// Request the judging of every pending cell of an invocation.
    pub fn run_invocation(&self, id: InvocationId) -> Result<Vec<JobId>, Error> {
        let invocation = self
            .ctx
            .invocations
            .get(id)
            .with_context(|| format!("Unknown invocation {}", id))?;
        let mut jobs = vec![];
        for solution in &invocation.solutions {
            for testcase in &invocation.testcases {
                let target = TargetRef::Cell {
                    commit: invocation.commit.clone(),
                    invocation: id,
                    solution: solution.clone(),
                    testcase: testcase.clone(),
                };
                jobs.push(self.request(target, JobType::EvaluateCell)?);
            }
        }
        Ok(jobs)
    }

    /// Wait for every cell of an invocation to reach a terminal result.
    pub fn wait_invocation(
        &self,
        id: InvocationId,
        timeout: Duration,
    ) -> Result<Invocation, Error> {
        let invocation = self
            .ctx
            .invocations
            .get(id)
            .with_context(|| format!("Unknown invocation {}", id))?;
        for solution in &invocation.solutions {
            for testcase in &invocation.testcases {
                let target = TargetRef::Cell {
                    commit: invocation.commit.clone(),
                    invocation: id,
                    solution: solution.clone(),
                    testcase: testcase.clone(),
                };
                self.wait(&target, JobType::EvaluateCell, timeout);
            }
        }
        self.ctx
            .invocations
            .get(id)
            .with_context(|| format!("Unknown invocation {}", id))
    }

    /// A snapshot of an invocation with its result matrix.
    pub fn invocation(&self, id: InvocationId) -> Option<Invocation> {
        self.ctx.invocations.get(id)
    }

    /// Whether the invocation is strictly valid.
    pub fn invocation_is_valid(&self, id: InvocationId) -> Result<bool, Error> {
        let invocation = self
            .ctx
            .invocations
            .get(id)
            .with_context(|| format!("Unknown invocation {}", id))?;
        let manifest = self.ctx.manifest(&invocation.commit)?;
        self.ctx.invocations.is_valid(id, &manifest)
    }

    /// Request the generation of every input and reference output of a commit. The validations
    /// fan out from the input generations.
    pub fn generate_all(&self, commit: &CommitId) -> Result<(), Error> {
        let manifest = self.ctx.manifest(commit)?;
        for testcase in &manifest.testcases {
            self.request(
                TargetRef::TestCaseInput {
                    commit: commit.clone(),
                    testcase: testcase.name.clone(),
                },
                JobType::GenerateInput,
            )?;
            self.request(
                TargetRef::TestCaseOutput {
                    commit: commit.clone(),
                    testcase: testcase.name.clone(),
                },
                JobType::GenerateOutput,
            )?;
        }
        Ok(())
    }

    /// Stop the workers, waiting for the running jobs to finish.
    pub fn shutdown(mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop();
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.stop();
        }
    }
}
