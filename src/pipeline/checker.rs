//! Running the checker and parsing its score.
//!
//! The checker contract: given the input, the reference output and the candidate output, print a
//! single floating point score in `[0, 1]` on stdout, and optionally a contestant-facing message
//! as the first line of stderr. Any deviation is a protocol violation reported as
//! `checker_failed`.

use anyhow::{Context, Error};

use taskprep_sandbox::{ExitStatus, SandboxFile, SandboxRequest};
use taskprep_store::{CommitId, FileHandle, FileKey, SourceKind};

use crate::context::PipelineContext;
use crate::manifest::ProblemManifest;
use crate::pipeline::to_box_command;
use crate::state::StepOutcome;
use crate::verdict::JudgeVerdict;

/// The outcome of checking one candidate output.
#[derive(Debug, Clone)]
pub(crate) struct CheckOutcome {
    /// `Ok` when the checker followed the contract, `CheckerFailed` otherwise.
    pub verdict: JudgeVerdict,
    /// The parsed score, present iff the verdict is `Ok`.
    pub score: Option<f64>,
    /// The first line of the checker's standard error.
    pub contestant_message: Option<String>,
    /// The raw standard output of the checker.
    pub checker_stdout: Option<String>,
    /// The raw standard error of the checker.
    pub checker_stderr: Option<String>,
    /// A human readable explanation.
    pub message: String,
}

/// The first line of a string, trimmed.
pub(crate) fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or("").trim().to_string()
}

/// Parse the stdout of a checker: a single float in `[0, 1]`.
pub fn parse_checker_score(stdout: &str) -> Result<f64, String> {
    let trimmed = stdout.trim();
    let score: f64 = trimmed
        .parse()
        .map_err(|_| format!("Invalid score {:?} from checker", trimmed))?;
    if !(0.0..=1.0).contains(&score) {
        return Err(format!("Score {} out of range", score));
    }
    Ok(score)
}

/// The built-in checker: 1.0 iff the two outputs have the same whitespace-separated tokens.
pub fn white_diff(correct: &[u8], candidate: &[u8]) -> f64 {
    let correct = String::from_utf8_lossy(correct);
    let candidate = String::from_utf8_lossy(candidate);
    if correct.split_whitespace().eq(candidate.split_whitespace()) {
        1.0
    } else {
        0.0
    }
}

/// Run the checker of the problem on `(input, correct_output, candidate_output)`.
pub(crate) fn run_checker(
    ctx: &PipelineContext,
    commit: &CommitId,
    manifest: &ProblemManifest,
    input: &FileHandle,
    correct: &FileHandle,
    candidate: &FileKey,
) -> Result<CheckOutcome, Error> {
    let candidate = ctx
        .file_store
        .get(candidate)
        .context("The candidate output vanished from the store")?;

    let checker_name = match &manifest.checker {
        Some(name) => name,
        None => {
            let score = white_diff(&correct.read_contents()?, &candidate.read_contents()?);
            let message = if score == 1.0 {
                "Output is correct"
            } else {
                "Output is incorrect"
            };
            return Ok(CheckOutcome {
                verdict: JudgeVerdict::Ok,
                score: Some(score),
                contestant_message: Some(message.to_string()),
                checker_stdout: None,
                checker_stderr: None,
                message: message.to_string(),
            });
        }
    };

    let state = ctx.state(commit)?;
    let source = state.read(|s| s.source(SourceKind::Checker, checker_name));
    let compiled = match (source.compilation, source.compiled) {
        (StepOutcome::Ok, Some(key)) => ctx
            .file_store
            .get(&key)
            .context("The compiled checker vanished from the store")?,
        _ => {
            return Ok(CheckOutcome {
                verdict: JudgeVerdict::CheckerFailed,
                score: None,
                contestant_message: None,
                checker_stdout: None,
                checker_stderr: None,
                message: format!("The checker {:?} is not compiled", checker_name),
            })
        }
    };
    let language = manifest
        .language_of(SourceKind::Checker, checker_name)
        .with_context(|| format!("Unsupported checker language for {:?}", checker_name))?;
    let main = language.main_unit(checker_name, &[]);
    let mut command_line = language.execution_command("checker", main.as_deref());
    command_line.extend([
        "input".to_string(),
        "correct_output".to_string(),
        "test_output".to_string(),
    ]);
    let request = SandboxRequest {
        description: format!("Checking a candidate output with {}", checker_name),
        commands: vec![to_box_command(command_line)],
        files: vec![
            SandboxFile::executable("checker", compiled),
            SandboxFile::read("input", input.clone()),
            SandboxFile::read("correct_output", correct.clone()),
            SandboxFile::read("test_output", candidate),
        ],
        stdin: None,
        outputs: vec![],
        limits: ctx.checker_limits(),
    };
    let outcome = ctx.run_sandbox(request)?;
    let stdout = outcome.stdout_content();
    let stderr = outcome.stderr_content();
    let contestant_message = Some(first_line(&stderr));

    match &outcome.status {
        ExitStatus::Ok => match parse_checker_score(&stdout) {
            Ok(score) => Ok(CheckOutcome {
                verdict: JudgeVerdict::Ok,
                score: Some(score),
                contestant_message,
                checker_stdout: Some(stdout),
                checker_stderr: Some(stderr),
                message: String::new(),
            }),
            Err(message) => Ok(CheckOutcome {
                verdict: JudgeVerdict::CheckerFailed,
                score: None,
                contestant_message,
                checker_stdout: Some(stdout),
                checker_stderr: Some(stderr),
                message,
            }),
        },
        status => Ok(CheckOutcome {
            verdict: JudgeVerdict::CheckerFailed,
            score: None,
            contestant_message,
            checker_stdout: Some(stdout),
            checker_stderr: Some(stderr),
            message: format!("The checker failed: {}", status),
        }),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_checker_score_valid() {
        assert_eq!(parse_checker_score("1.0\n"), Ok(1.0));
        assert_eq!(parse_checker_score(" 0 "), Ok(0.0));
        assert_eq!(parse_checker_score("0.5"), Ok(0.5));
    }

    #[test]
    fn test_parse_checker_score_not_a_number() {
        assert!(parse_checker_score("oops").is_err());
        assert!(parse_checker_score("").is_err());
        assert!(parse_checker_score("1.0 extra").is_err());
    }

    #[test]
    fn test_parse_checker_score_out_of_range() {
        assert!(parse_checker_score("1.5").is_err());
        assert!(parse_checker_score("-0.1").is_err());
    }

    #[test]
    fn test_white_diff_equal_modulo_spaces() {
        assert_eq!(white_diff(b"1 2  3\n", b"1 2 3"), 1.0);
        assert_eq!(white_diff(b"a\nb\n", b"a b"), 1.0);
    }

    #[test]
    fn test_white_diff_different() {
        assert_eq!(white_diff(b"1 2 3", b"1 2 4"), 0.0);
        assert_eq!(white_diff(b"1 2 3", b"1 2"), 0.0);
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("hello\nworld"), "hello");
        assert_eq!(first_line("  spaced  \nrest"), "spaced");
        assert_eq!(first_line(""), "");
    }
}
