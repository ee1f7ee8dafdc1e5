//! The seam between the sandbox contract and the actual isolation backend.

use std::path::{Path, PathBuf};

use tabox::configuration::SandboxConfiguration;
use tabox::result::ExitStatus as TaboxExitStatus;
use tabox::syscall_filter::SyscallFilter;
use tabox::{Sandbox as _, SandboxImplementation};

use crate::{BoxCommand, ResourceLimits, SandboxCommand};

/// The list of all the system-wide readable directories inside the sandbox.
const READABLE_DIRS: &[&str] = &[
    "/lib",
    "/lib64",
    "/usr",
    "/bin",
    "/opt",
    // update-alternatives stuff, sometimes the executables are symlinked here
    "/etc/alternatives/",
    "/var/lib/dpkg/alternatives/",
];

/// Everything a runner needs to spawn one command of a request.
#[derive(Debug)]
pub struct RunContext<'a> {
    /// The working directory of the sandboxed process.
    pub boxdir: &'a Path,
    /// The command to run.
    pub command: &'a SandboxCommand,
    /// The limits to enforce.
    pub limits: &'a ResourceLimits,
    /// Path of the file to feed to the standard input.
    pub stdin: Option<PathBuf>,
    /// Path of the file capturing the standard output.
    pub stdout: PathBuf,
    /// Path of the file capturing the standard error.
    pub stderr: PathBuf,
    /// The id of the box running this command.
    pub box_id: u32,
}

/// Raw statistics of a single spawned command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRunStats {
    /// Exit code of the process, if it exited normally.
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    /// Whether the process was killed by the sandbox.
    pub killed: bool,
    /// Cpu time used in user space, in seconds.
    pub cpu_time: f64,
    /// Cpu time used in kernel space, in seconds.
    pub sys_time: f64,
    /// Wall-clock time of the process, in seconds.
    pub wall_time: f64,
    /// Peak memory usage, in bytes.
    pub memory: u64,
}

/// The result of spawning a single command: either the statistics of the completed process or a
/// failure of the sandbox itself.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRunResult {
    /// The sandbox ran the process to completion.
    Success(RawRunStats),
    /// The sandbox failed to run the process, with the attached diagnostic.
    Error(String),
}

/// Something able to spawn a sandboxed process, wait for it to exit and report the raw outcome.
pub trait SandboxRunner: Send + Sync {
    /// Spawn the command described by the context and wait for it.
    fn run(&self, ctx: &RunContext) -> RawRunResult;
}

impl<S: SandboxRunner> SandboxRunner for std::sync::Arc<S> {
    fn run(&self, ctx: &RunContext) -> RawRunResult {
        self.as_ref().run(ctx)
    }
}

/// The real runner, backed by the `tabox` isolation.
#[derive(Debug, Default, Clone)]
pub struct TaboxRunner;

impl SandboxRunner for TaboxRunner {
    fn run(&self, ctx: &RunContext) -> RawRunResult {
        match run_tabox(ctx) {
            Ok(res) => res,
            Err(e) => RawRunResult::Error(e.to_string()),
        }
    }
}

/// Build the tabox configuration and run the command, with a return type supporting `?`.
fn run_tabox(ctx: &RunContext) -> Result<RawRunResult, anyhow::Error> {
    use anyhow::Context;

    let mut config = SandboxConfiguration::default();
    config.working_directory(ctx.boxdir);
    config.mount(ctx.boxdir, ctx.boxdir, true);
    config.env("PATH", std::env::var("PATH").unwrap_or_default());
    config.stdin(ctx.stdin.clone().unwrap_or_else(|| "/dev/null".into()));
    config.stdout(ctx.stdout.clone());
    config.stderr(ctx.stderr.clone());
    if let Some(cpu) = ctx.limits.cpu_time {
        config.time_limit(cpu.ceil() as u64);
    }
    if let Some(wall) = ctx.limits.effective_wall_time() {
        config.wall_time_limit(wall.ceil() as u64);
    }
    if let Some(memory) = ctx.limits.memory {
        config.memory_limit(memory * 1024);
    }
    config.syscall_filter(SyscallFilter::build(true, true));
    for dir in READABLE_DIRS {
        if Path::new(dir).is_dir() {
            config.mount(dir, dir, false);
        }
    }
    match &ctx.command.command {
        BoxCommand::System(cmd) => {
            if let Ok(cmd) = which::which(cmd) {
                config.executable(cmd);
            } else {
                return Ok(RawRunResult::Error(format!(
                    "Executable {:?} not found",
                    cmd
                )));
            }
        }
        BoxCommand::Local(cmd) => {
            let host_cmd = ctx.boxdir.join(cmd);
            if !host_cmd.is_file() {
                return Ok(RawRunResult::Error(format!(
                    "Local executable {:?} is missing",
                    cmd
                )));
            }
            config.executable(host_cmd);
        }
    }
    for arg in &ctx.command.args {
        config.arg(arg);
    }
    // drop root privileges inside the sandbox
    config.uid(1000);
    config.gid(1000);

    let sandbox =
        SandboxImplementation::run(config.build()).context("Failed to create sandbox")?;
    let res = sandbox.wait().context("Failed to wait sandbox")?;
    let (exit_code, signal) = match res.status {
        TaboxExitStatus::ExitCode(code) => (Some(code), None),
        TaboxExitStatus::Signal(sig) => (None, Some(sig)),
        TaboxExitStatus::Killed => (None, None),
    };
    Ok(RawRunResult::Success(RawRunStats {
        exit_code,
        signal,
        killed: res.status == TaboxExitStatus::Killed,
        cpu_time: res.resource_usage.user_cpu_time,
        sys_time: res.resource_usage.system_cpu_time,
        wall_time: res.resource_usage.wall_time_usage,
        memory: res.resource_usage.memory_usage as u64,
    }))
}

/// A fake runner that doesn't spawn anything and always reports a sandbox failure.
#[derive(Debug, Default, Clone)]
pub struct ErrorSandboxRunner;

impl SandboxRunner for ErrorSandboxRunner {
    fn run(&self, _ctx: &RunContext) -> RawRunResult {
        RawRunResult::Error("Nope".to_owned())
    }
}

/// A fake runner that doesn't spawn anything and always reports a successful exit with code 0.
#[derive(Debug, Default, Clone)]
pub struct SuccessSandboxRunner;

impl SandboxRunner for SuccessSandboxRunner {
    fn run(&self, _ctx: &RunContext) -> RawRunResult {
        RawRunResult::Success(RawRunStats {
            exit_code: Some(0),
            ..Default::default()
        })
    }
}

/// A fake runner delegating to a closure, letting the tests fake the behaviour of each command,
/// including writing the captured output files.
pub struct ScriptedSandboxRunner<F>(
    /// The closure run in place of each command.
    pub F,
)
where
    F: Fn(&RunContext) -> RawRunResult + Send + Sync;

impl<F> SandboxRunner for ScriptedSandboxRunner<F>
where
    F: Fn(&RunContext) -> RawRunResult + Send + Sync,
{
    fn run(&self, ctx: &RunContext) -> RawRunResult {
        (self.0)(ctx)
    }
}

impl RawRunStats {
    /// Statistics of a process that exited normally with the given code.
    pub fn with_exit_code(code: i32) -> RawRunStats {
        RawRunStats {
            exit_code: Some(code),
            ..Default::default()
        }
    }
}
