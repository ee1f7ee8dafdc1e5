//! Sandbox execution contract of the preparation pipeline.
//!
//! A job that needs an effect builds a [`SandboxRequest`]: a list of commands to run in sequence,
//! the files to place inside the isolated directory, the resource limits and the names of the
//! output files to extract. Running the request yields a [`SandboxOutcome`] with a structured
//! [`ExitStatus`], the resource usage and the extracted files, already published to the
//! [`FileStore`](taskprep_store::FileStore).
//!
//! The actual isolation backend sits behind the [`SandboxRunner`](runner::SandboxRunner) trait:
//! the real one drives `tabox`, while the test ones fake the execution entirely.

#![deny(missing_docs)]

#[macro_use]
extern crate log;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use taskprep_store::FileHandle;

mod boxid;
pub mod runner;
mod sandbox;

pub use boxid::{BoxIdAllocator, BoxLease};
pub use runner::{
    ErrorSandboxRunner, RawRunResult, RawRunStats, RunContext, SandboxRunner,
    ScriptedSandboxRunner, SuccessSandboxRunner, TaboxRunner,
};
pub use sandbox::Sandbox;

/// Command to execute inside the sandbox.
///
/// A `System` command is searched in the `PATH` of the worker, a `Local` command is relative to
/// the sandbox directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BoxCommand {
    /// A system command, e.g. the compilers.
    System(PathBuf),
    /// A command relative to the sandbox directory, e.g. a compiled generator.
    Local(PathBuf),
}

impl BoxCommand {
    /// Make a new `System` command.
    pub fn system<P: Into<PathBuf>>(cmd: P) -> BoxCommand {
        BoxCommand::System(cmd.into())
    }

    /// Make a new `Local` command.
    pub fn local<P: Into<PathBuf>>(cmd: P) -> BoxCommand {
        BoxCommand::Local(cmd.into())
    }
}

/// A single command line of a [`SandboxRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxCommand {
    /// The command to execute.
    pub command: BoxCommand,
    /// The command line arguments.
    pub args: Vec<String>,
}

impl SandboxCommand {
    /// Make a new `SandboxCommand`.
    pub fn new<S: Into<String>, I: IntoIterator<Item = S>>(
        command: BoxCommand,
        args: I,
    ) -> SandboxCommand {
        SandboxCommand {
            command,
            args: args.into_iter().map(|s| s.into()).collect(),
        }
    }
}

/// Access mode of a file placed inside the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    /// The file can only be read.
    Read,
    /// The file can be written. When no source artifact is given an empty file is created.
    Write,
    /// The file can be read and executed.
    Executable,
}

/// A file to place inside the sandbox before the execution.
#[derive(Debug, Clone)]
pub struct SandboxFile {
    /// Name of the file inside the sandbox, relative to the working directory.
    pub name: PathBuf,
    /// The artifact with the content of the file, `None` for an empty placeholder.
    pub source: Option<FileHandle>,
    /// The access mode of the file.
    pub mode: FileMode,
}

impl SandboxFile {
    /// A read-only input file.
    pub fn read<P: Into<PathBuf>>(name: P, source: FileHandle) -> SandboxFile {
        SandboxFile {
            name: name.into(),
            source: Some(source),
            mode: FileMode::Read,
        }
    }

    /// An executable file.
    pub fn executable<P: Into<PathBuf>>(name: P, source: FileHandle) -> SandboxFile {
        SandboxFile {
            name: name.into(),
            source: Some(source),
            mode: FileMode::Executable,
        }
    }
}

/// Limits enforced on every command of a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Limit on the cpu time, in seconds.
    pub cpu_time: Option<f64>,
    /// Limit on the wall-clock time, in seconds. When missing it defaults to
    /// `2 × cpu_time + 1`.
    pub wall_time: Option<f64>,
    /// Limit on the memory usage, in KiB.
    pub memory: Option<u64>,
}

impl ResourceLimits {
    /// Make a new empty set of limits.
    pub fn new() -> ResourceLimits {
        Default::default()
    }

    /// Set the cpu time limit, in seconds.
    pub fn cpu_time(mut self, limit: f64) -> ResourceLimits {
        self.cpu_time = Some(limit);
        self
    }

    /// Set the wall-clock time limit, in seconds.
    pub fn wall_time(mut self, limit: f64) -> ResourceLimits {
        self.wall_time = Some(limit);
        self
    }

    /// Set the memory limit, in KiB.
    pub fn memory(mut self, limit: u64) -> ResourceLimits {
        self.memory = Some(limit);
        self
    }

    /// The wall-clock limit actually enforced: the explicit one, or the default derived from the
    /// cpu limit.
    pub fn effective_wall_time(&self) -> Option<f64> {
        self.wall_time
            .or_else(|| self.cpu_time.map(|cpu| 2.0 * cpu + 1.0))
    }
}

/// A request to run a command list under the sandbox.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    /// Human readable description of the request, for the logs.
    pub description: String,
    /// The commands to run in sequence. The sequence stops at the first faulty command.
    pub commands: Vec<SandboxCommand>,
    /// The files to place inside the sandbox.
    pub files: Vec<SandboxFile>,
    /// The artifact to feed to the standard input of the commands.
    pub stdin: Option<FileHandle>,
    /// Names of the output files to extract after a successful run.
    pub outputs: Vec<String>,
    /// The limits enforced on each command.
    pub limits: ResourceLimits,
}

/// Structured exit status of a sandbox request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    /// Every command exited with status 0 within the limits.
    Ok,
    /// A command exceeded the cpu time limit.
    TimeoutCpu,
    /// A command exceeded the wall-clock time limit.
    TimeoutWall,
    /// A command was terminated by a signal, attached.
    KilledSignal(u32),
    /// A command exited with a non-zero status code, attached.
    NonzeroReturn(u32),
    /// A command issued a syscall forbidden by the isolation policy.
    ForbiddenSyscall(String),
    /// A command touched a file outside the isolation policy.
    ForbiddenFile(String),
    /// The sandbox itself failed, with the attached diagnostic. This is not a fault of the
    /// sandboxed program.
    SandboxError(String),
}

impl ExitStatus {
    /// Whether the request completed without faults.
    pub fn is_ok(&self) -> bool {
        matches!(self, ExitStatus::Ok)
    }

    /// Whether the sandbox itself failed, as opposed to the sandboxed program.
    pub fn is_sandbox_error(&self) -> bool {
        matches!(self, ExitStatus::SandboxError(_))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Ok => write!(f, "ok"),
            ExitStatus::TimeoutCpu => write!(f, "cpu time limit exceeded"),
            ExitStatus::TimeoutWall => write!(f, "wall clock time limit exceeded"),
            ExitStatus::KilledSignal(sig) => write!(f, "killed by signal {}", sig),
            ExitStatus::NonzeroReturn(code) => write!(f, "exited with status {}", code),
            ExitStatus::ForbiddenSyscall(name) => write!(f, "forbidden syscall {}", name),
            ExitStatus::ForbiddenFile(name) => write!(f, "forbidden file access {}", name),
            ExitStatus::SandboxError(msg) => write!(f, "sandbox error: {}", msg),
        }
    }
}

/// The outcome of a sandbox request.
#[derive(Debug, Clone)]
pub struct SandboxOutcome {
    /// The structured exit status.
    pub status: ExitStatus,
    /// Total cpu time used by the commands, in seconds.
    pub cpu_time: f64,
    /// Total wall-clock time used by the commands, in seconds.
    pub wall_time: f64,
    /// Peak memory usage among the commands, in KiB.
    pub memory: u64,
    /// Exit code of the last executed command.
    pub exit_code: u32,
    /// The captured standard output of the commands.
    pub stdout: FileHandle,
    /// The captured standard error of the commands.
    pub stderr: FileHandle,
    /// The extracted output files, by name. Only present after a successful run.
    pub outputs: HashMap<String, FileHandle>,
}

impl SandboxOutcome {
    /// The content of the captured standard output, lossy decoded.
    pub fn stdout_content(&self) -> String {
        match self.stdout.read_contents() {
            Ok(content) => String::from_utf8_lossy(&content).into_owned(),
            Err(_) => String::new(),
        }
    }

    /// The content of the captured standard error, lossy decoded.
    pub fn stderr_content(&self) -> String {
        match self.stderr.read_contents() {
            Ok(content) => String::from_utf8_lossy(&content).into_owned(),
            Err(_) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_effective_wall_time_default() {
        let limits = ResourceLimits::new().cpu_time(2.0);
        assert_eq!(limits.effective_wall_time(), Some(5.0));
    }

    #[test]
    fn test_effective_wall_time_explicit() {
        let limits = ResourceLimits::new().cpu_time(2.0).wall_time(10.0);
        assert_eq!(limits.effective_wall_time(), Some(10.0));
    }

    #[test]
    fn test_effective_wall_time_unlimited() {
        assert_eq!(ResourceLimits::new().effective_wall_time(), None);
    }
}
