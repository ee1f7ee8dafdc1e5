//! The task-type strategies: how a solution is executed and how its output is collected.
//!
//! Only `Batch` (stdin to stdout, compiled with the graders) is built in; the other task types of
//! the original taxonomy (communication, output-only, two-steps) plug in behind the same trait.

mod batch;

pub use batch::Batch;

use std::sync::Arc;

use anyhow::Error;

use taskprep_store::{CommitId, FileKey};

use crate::context::PipelineContext;
use crate::manifest::ProblemManifest;
use crate::verdict::JudgeVerdict;

/// The outcome of running a solution on a test case through a task type.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// Whether the run itself completed (regardless of the verdict). `false` only for
    /// infrastructure faults.
    pub success: bool,
    /// The verdict of the run.
    pub verdict: JudgeVerdict,
    /// The key of the produced output artifact, if any.
    pub output: Option<FileKey>,
    /// Cpu time of the run, in seconds.
    pub execution_time: Option<f64>,
    /// Peak memory of the run, in KiB.
    pub execution_memory: Option<u64>,
    /// A human readable explanation.
    pub message: String,
}

impl EvaluationResult {
    /// A result of a run that never started, with only a verdict and an explanation.
    pub fn failure<S: Into<String>>(verdict: JudgeVerdict, message: S) -> EvaluationResult {
        EvaluationResult {
            success: false,
            verdict,
            output: None,
            execution_time: None,
            execution_memory: None,
            message: message.into(),
        }
    }
}

/// A strategy controlling how the solutions of a problem are executed.
pub trait TaskType: Send + Sync + std::fmt::Debug {
    /// The name of the task type, as spelled in the manifests.
    fn name(&self) -> &'static str;

    /// Prepare the problem for judging. Returns whether the initialization succeeded and a
    /// message.
    fn initialize_problem(
        &self,
        ctx: &PipelineContext,
        commit: &CommitId,
        manifest: &ProblemManifest,
    ) -> Result<(bool, String), Error>;

    /// Register a test case with the judge. Returns whether the registration succeeded and a
    /// message.
    fn add_testcase(
        &self,
        ctx: &PipelineContext,
        commit: &CommitId,
        manifest: &ProblemManifest,
        testcase: &str,
        input: &FileKey,
    ) -> Result<(bool, String), Error>;

    /// Run a solution on a test case and collect its output. The solution must already be
    /// compiled; the input artifact must exist.
    fn generate_output(
        &self,
        ctx: &PipelineContext,
        commit: &CommitId,
        manifest: &ProblemManifest,
        testcase: &str,
        solution: &str,
    ) -> Result<EvaluationResult, Error>;
}

/// Look up a task type by name, `None` if it is not supported.
pub fn from_name(name: &str) -> Option<Arc<dyn TaskType>> {
    match name {
        "Batch" => Some(Arc::new(Batch)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(from_name("Batch").unwrap().name(), "Batch");
        assert!(from_name("Communication").is_none());
    }
}
