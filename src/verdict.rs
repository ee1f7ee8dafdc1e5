//! The closed sets of judging outcomes and author expectations.

use serde::{Deserialize, Serialize};

use taskprep_sandbox::ExitStatus;

/// The terminal outcome of judging one (invocation, solution, test case) cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeVerdict {
    /// The solution ran within the limits and the checker scored its output.
    Ok,
    /// The language of the solution is not supported.
    InvalidSubmission,
    /// The compilation of the solution failed.
    CompilationFailed,
    /// The input or the reference output of the test case is unavailable.
    InvalidTestcase,
    /// The solution crashed or exited with a non-zero status.
    RuntimeError,
    /// The solution exceeded the time limit.
    TimeLimitExceeded,
    /// The solution exceeded the memory limit.
    MemoryLimitExceeded,
    /// The checker crashed or produced ill-formed output.
    CheckerFailed,
    /// The sandbox failed or the pipeline hit an internal error.
    JudgeFailed,
}

impl std::fmt::Display for JudgeVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JudgeVerdict::Ok => "ok",
            JudgeVerdict::InvalidSubmission => "invalid submission",
            JudgeVerdict::CompilationFailed => "compilation failed",
            JudgeVerdict::InvalidTestcase => "invalid testcase",
            JudgeVerdict::RuntimeError => "runtime error",
            JudgeVerdict::TimeLimitExceeded => "time limit exceeded",
            JudgeVerdict::MemoryLimitExceeded => "memory limit exceeded",
            JudgeVerdict::CheckerFailed => "checker failed",
            JudgeVerdict::JudgeFailed => "judge failed",
        };
        f.write_str(name)
    }
}

/// The author-declared intention for a solution: what its cells are expected to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectedVerdict {
    /// The model solution, always correct.
    ModelSolution,
    /// A correct solution: full score everywhere.
    Correct,
    /// A wrong solution: score zero.
    Incorrect,
    /// A solution expected to exceed the time limit.
    TimeLimit,
    /// A solution expected to exceed the memory limit.
    MemoryLimit,
    /// A solution expected to crash.
    RuntimeError,
    /// A solution expected to fail in any way.
    Failed,
    /// A solution expected to either exceed the time limit or crash.
    TimeLimitAndRuntimeError,
}

/// Whether a terminal cell matches the expectation. This is a pure function of the expectation
/// and the cell's terminal state.
pub fn matches_expectation(
    expected: ExpectedVerdict,
    verdict: JudgeVerdict,
    score: Option<f64>,
) -> bool {
    match expected {
        ExpectedVerdict::ModelSolution | ExpectedVerdict::Correct => {
            verdict == JudgeVerdict::Ok && score == Some(1.0)
        }
        ExpectedVerdict::Incorrect => verdict == JudgeVerdict::Ok && score == Some(0.0),
        ExpectedVerdict::RuntimeError => verdict == JudgeVerdict::RuntimeError,
        ExpectedVerdict::TimeLimit => verdict == JudgeVerdict::TimeLimitExceeded,
        ExpectedVerdict::MemoryLimit => verdict == JudgeVerdict::MemoryLimitExceeded,
        ExpectedVerdict::Failed => verdict != JudgeVerdict::Ok || score == Some(0.0),
        ExpectedVerdict::TimeLimitAndRuntimeError => matches!(
            verdict,
            JudgeVerdict::TimeLimitExceeded | JudgeVerdict::RuntimeError
        ),
    }
}

/// Map the exit of a solution run to its verdict. A kill signal with the peak memory at the limit
/// is classified as a memory limit hit.
pub fn verdict_from_exit(
    status: &ExitStatus,
    memory_kib: u64,
    memory_limit_kib: Option<u64>,
) -> JudgeVerdict {
    match status {
        ExitStatus::Ok => JudgeVerdict::Ok,
        ExitStatus::TimeoutCpu | ExitStatus::TimeoutWall => JudgeVerdict::TimeLimitExceeded,
        ExitStatus::KilledSignal(_) => match memory_limit_kib {
            Some(limit) if memory_kib >= limit => JudgeVerdict::MemoryLimitExceeded,
            _ => JudgeVerdict::RuntimeError,
        },
        ExitStatus::NonzeroReturn(_) => JudgeVerdict::RuntimeError,
        ExitStatus::ForbiddenSyscall(_) | ExitStatus::ForbiddenFile(_) => {
            JudgeVerdict::RuntimeError
        }
        ExitStatus::SandboxError(_) => JudgeVerdict::JudgeFailed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correct_requires_full_score() {
        assert!(matches_expectation(
            ExpectedVerdict::Correct,
            JudgeVerdict::Ok,
            Some(1.0)
        ));
        assert!(!matches_expectation(
            ExpectedVerdict::Correct,
            JudgeVerdict::Ok,
            Some(0.5)
        ));
        assert!(!matches_expectation(
            ExpectedVerdict::Correct,
            JudgeVerdict::RuntimeError,
            None
        ));
    }

    #[test]
    fn test_incorrect_requires_zero_score() {
        assert!(matches_expectation(
            ExpectedVerdict::Incorrect,
            JudgeVerdict::Ok,
            Some(0.0)
        ));
        assert!(!matches_expectation(
            ExpectedVerdict::Incorrect,
            JudgeVerdict::Ok,
            Some(1.0)
        ));
    }

    #[test]
    fn test_failed_matches_any_fault() {
        assert!(matches_expectation(
            ExpectedVerdict::Failed,
            JudgeVerdict::RuntimeError,
            None
        ));
        assert!(matches_expectation(
            ExpectedVerdict::Failed,
            JudgeVerdict::Ok,
            Some(0.0)
        ));
        assert!(!matches_expectation(
            ExpectedVerdict::Failed,
            JudgeVerdict::Ok,
            Some(1.0)
        ));
    }

    #[test]
    fn test_time_limit_and_runtime_error() {
        for verdict in [JudgeVerdict::TimeLimitExceeded, JudgeVerdict::RuntimeError] {
            assert!(matches_expectation(
                ExpectedVerdict::TimeLimitAndRuntimeError,
                verdict,
                None
            ));
        }
        assert!(!matches_expectation(
            ExpectedVerdict::TimeLimitAndRuntimeError,
            JudgeVerdict::Ok,
            Some(1.0)
        ));
    }

    #[test]
    fn test_verdict_from_exit_memory_kill() {
        let status = ExitStatus::KilledSignal(9);
        assert_eq!(
            verdict_from_exit(&status, 262144, Some(262144)),
            JudgeVerdict::MemoryLimitExceeded
        );
        assert_eq!(
            verdict_from_exit(&status, 1024, Some(262144)),
            JudgeVerdict::RuntimeError
        );
        assert_eq!(verdict_from_exit(&status, 1024, None), JudgeVerdict::RuntimeError);
    }

    #[test]
    fn test_verdict_from_exit_timeouts() {
        assert_eq!(
            verdict_from_exit(&ExitStatus::TimeoutCpu, 0, None),
            JudgeVerdict::TimeLimitExceeded
        );
        assert_eq!(
            verdict_from_exit(&ExitStatus::TimeoutWall, 0, None),
            JudgeVerdict::TimeLimitExceeded
        );
    }
}
