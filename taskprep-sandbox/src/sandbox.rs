use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use tempfile::TempDir;

use taskprep_store::FileStore;

use crate::runner::{RawRunResult, RunContext, SandboxRunner};
use crate::{BoxLease, ExitStatus, SandboxOutcome, SandboxRequest};

/// A prepared sandbox directory for a [`SandboxRequest`].
///
/// The sandbox owns a private temporary directory with a `box/` working directory inside; the
/// request's files are copied there before the run and the directory is destroyed on drop, unless
/// [`keep`](Sandbox::keep) was called.
///
/// This sandbox works only on Unix systems because it needs to set the executable bit on some
/// files.
pub struct Sandbox {
    /// Handle of the temporary directory, deleted on drop. It's always `Some(_)` except inside
    /// `Drop`.
    boxdir: Option<TempDir>,
    /// The request to run.
    request: SandboxRequest,
    /// The lease of the box id, released on teardown.
    lease: BoxLease,
    /// Whether to keep the sandbox directory after the execution.
    keep_sandbox: bool,
}

impl Sandbox {
    /// Make a new sandbox for the request, copying all the required files inside.
    pub fn new(
        sandboxes_dir: &Path,
        request: SandboxRequest,
        lease: BoxLease,
    ) -> Result<Sandbox, Error> {
        std::fs::create_dir_all(sandboxes_dir).with_context(|| {
            format!(
                "Failed to create sandboxes directory at {}",
                sandboxes_dir.display()
            )
        })?;
        let boxdir = TempDir::with_prefix_in(format!("box{}-", lease.id()), sandboxes_dir)
            .context("Failed to create sandbox directory")?;
        Sandbox::setup(boxdir.path(), &request)?;
        Ok(Sandbox {
            boxdir: Some(boxdir),
            request,
            lease,
            keep_sandbox: false,
        })
    }

    /// Run the request, blocking until every command exits, and publish the captured files to the
    /// store.
    ///
    /// The commands run in sequence inside the same box; the sequence stops at the first faulty
    /// command. The outcome is `Ok` iff every command exited with status 0 within the limits.
    pub fn run(
        &self,
        runner: &dyn SandboxRunner,
        store: &FileStore,
    ) -> Result<SandboxOutcome, Error> {
        let dir = self.path();
        trace!("Running sandbox at {:?} for '{}'", dir, self.request.description);
        let boxdir = dir.join("box");
        let stdin = self.request.stdin.as_ref().map(|_| dir.join("stdin"));

        let mut status = ExitStatus::Ok;
        let mut cpu_time = 0.0;
        let mut wall_time = 0.0;
        let mut memory = 0;
        let mut exit_code = 0;
        for command in &self.request.commands {
            let ctx = RunContext {
                boxdir: &boxdir,
                command,
                limits: &self.request.limits,
                stdin: stdin.clone(),
                stdout: dir.join("stdout"),
                stderr: dir.join("stderr"),
                box_id: self.lease.id(),
            };
            let stats = match runner.run(&ctx) {
                RawRunResult::Success(stats) => stats,
                RawRunResult::Error(message) => {
                    status = ExitStatus::SandboxError(message);
                    break;
                }
            };
            cpu_time += stats.cpu_time + stats.sys_time;
            wall_time += stats.wall_time;
            memory = memory.max(stats.memory / 1024);
            status = self.command_status(&stats);
            if let Some(code) = stats.exit_code {
                exit_code = code as u32;
            }
            if !status.is_ok() {
                break;
            }
        }

        let stdout = store
            .store_file(dir.join("stdout"))
            .context("Failed to store the captured stdout")?;
        let stderr = store
            .store_file(dir.join("stderr"))
            .context("Failed to store the captured stderr")?;
        let mut outputs = HashMap::new();
        if status.is_ok() {
            for name in &self.request.outputs {
                let path = boxdir.join(name);
                if path.is_file() {
                    let handle = store.store_file(&path).with_context(|| {
                        format!("Failed to store the output file {}", name)
                    })?;
                    outputs.insert(name.clone(), handle);
                }
            }
        }
        Ok(SandboxOutcome {
            status,
            cpu_time,
            wall_time,
            memory,
            exit_code,
            stdout,
            stderr,
            outputs,
        })
    }

    /// Classify the exit of a single command against the limits.
    ///
    /// The limits are checked before the signals because exceeding them may trigger a kill from
    /// the sandbox.
    fn command_status(&self, stats: &crate::RawRunStats) -> ExitStatus {
        let limits = &self.request.limits;
        if let Some(cpu_limit) = limits.cpu_time {
            if stats.cpu_time + stats.sys_time > cpu_limit {
                return ExitStatus::TimeoutCpu;
            }
        }
        if let Some(wall_limit) = limits.effective_wall_time() {
            if stats.wall_time > wall_limit {
                return ExitStatus::TimeoutWall;
            }
        }
        if let Some(signal) = stats.signal {
            return ExitStatus::KilledSignal(signal as u32);
        }
        match stats.exit_code {
            Some(0) => ExitStatus::Ok,
            Some(code) => ExitStatus::NonzeroReturn(code as u32),
            // killed without a signal nor an exceeded limit: the sandbox gave up waiting
            None => ExitStatus::TimeoutWall,
        }
    }

    /// Make the sandbox persistent, the sandbox directory won't be deleted after the execution.
    pub fn keep(&mut self) {
        debug!("Keeping sandbox at {:?}", self.path());
        self.keep_sandbox = true;
    }

    /// Path of the sandbox directory.
    pub fn path(&self) -> &Path {
        self.boxdir.as_ref().expect("Sandbox dir is gone").path()
    }

    /// Setup the sandbox directory with all the files required for the execution.
    fn setup(dir: &Path, request: &SandboxRequest) -> Result<(), Error> {
        trace!("Setting up sandbox at {:?} for '{}'", dir, request.description);
        let boxdir = dir.join("box");
        std::fs::create_dir_all(&boxdir)?;
        if let Some(stdin) = &request.stdin {
            Sandbox::write_sandbox_file(&dir.join("stdin"), stdin.path(), false)?;
        }
        Sandbox::touch_file(&dir.join("stdout"), 0o600)?;
        Sandbox::touch_file(&dir.join("stderr"), 0o600)?;
        for file in &request.files {
            let dest = boxdir.join(&file.name);
            match (&file.source, file.mode) {
                (Some(source), crate::FileMode::Executable) => {
                    Sandbox::write_sandbox_file(&dest, source.path(), true)?;
                }
                (Some(source), crate::FileMode::Read) => {
                    Sandbox::write_sandbox_file(&dest, source.path(), false)?;
                }
                (Some(source), crate::FileMode::Write) => {
                    std::fs::create_dir_all(dest.parent().expect("Invalid file name"))?;
                    std::fs::copy(source.path(), &dest)?;
                    Sandbox::set_permissions(&dest, 0o600)?;
                }
                (None, _) => {
                    Sandbox::touch_file(&dest, 0o600)?;
                }
            }
        }
        for name in &request.outputs {
            let dest = boxdir.join(name);
            if !dest.exists() {
                Sandbox::touch_file(&dest, 0o600)?;
            }
        }
        trace!("Sandbox at {:?} ready!", dir);
        Ok(())
    }

    /// Put a file inside the sandbox, creating the directories if needed and making it executable
    /// if needed.
    ///
    /// The file will have the most restrictive permissions possible:
    /// - `r--------` (0o400) if not executable.
    /// - `r-x------` (0o500) if executable.
    fn write_sandbox_file(dest: &Path, source: &Path, executable: bool) -> Result<(), Error> {
        std::fs::create_dir_all(dest.parent().expect("Invalid file name"))?;
        std::fs::copy(source, dest)
            .with_context(|| format!("Failed to copy {:?} -> {:?}", source, dest))?;
        if executable {
            Sandbox::set_permissions(dest, 0o500)?;
        } else {
            Sandbox::set_permissions(dest, 0o400)?;
        }
        Ok(())
    }

    /// Create an empty file inside the sandbox and chmod-it.
    fn touch_file(dest: &Path, mode: u32) -> Result<(), Error> {
        std::fs::create_dir_all(dest.parent().expect("Invalid file name"))?;
        std::fs::File::create(dest)?;
        Sandbox::set_permissions(dest, mode)?;
        Ok(())
    }

    fn set_permissions(dest: &Path, perm: u32) -> Result<(), Error> {
        let mut permissions = std::fs::metadata(dest)?.permissions();
        permissions.set_mode(perm);
        std::fs::set_permissions(dest, permissions)?;
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if self.keep_sandbox {
            if let Some(boxdir) = self.boxdir.take() {
                let path = boxdir.keep();
                debug!("Sandbox directory kept at {:?}", path);
            }
        } else if let Some(boxdir) = self.boxdir.take() {
            // the sandbox may have made files read-only, restore the write bit before removing
            let _ = restore_write_bit(boxdir.path());
        }
    }
}

/// Recursively give back the write permission to the files of a directory so that the temporary
/// directory can be removed.
fn restore_write_bit(dir: &Path) -> Result<(), Error> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let mut perms = entry.metadata()?.permissions();
        if perms.readonly() || perms.mode() & 0o200 == 0 {
            perms.set_mode(perms.mode() | 0o200);
            std::fs::set_permissions(&path, perms)?;
        }
        if path.is_dir() {
            restore_write_bit(&path)?;
        }
    }
    Ok(())
}
