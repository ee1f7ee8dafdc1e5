//! Helpers shared by the end-to-end scenarios: a problem package builder and a scripted sandbox
//! backend faking the compilers, the generators, the solutions and the checkers.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use taskprep::snapshot::DirSnapshotProvider;
use taskprep::{Pipeline, PipelineConfig};
use taskprep_queue::SchedulerConfig;
use taskprep_sandbox::{
    BoxCommand, RawRunResult, RawRunStats, RunContext, ScriptedSandboxRunner,
};
use taskprep_store::CommitId;

/// How long the scenarios wait for a single target.
pub const WAIT: Duration = Duration::from_secs(30);

/// Write a problem package to disk: the manifest plus the named files.
pub fn write_package(dir: &Path, manifest: &serde_json::Value, files: &[(&str, &str)]) {
    std::fs::write(
        dir.join("info.json"),
        serde_json::to_vec_pretty(manifest).unwrap(),
    )
    .unwrap();
    for (path, content) in files {
        let path = dir.join(path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

/// Start a pipeline over a package checkout with a fast retry policy and the scripted backend.
pub fn start_pipeline(store_dir: &Path, commit: &CommitId, package_dir: &Path) -> Pipeline {
    let mut config = PipelineConfig::new(store_dir);
    config.workers = 4;
    config.scheduler = SchedulerConfig {
        base_wait: Duration::from_millis(10),
        max_wait: Duration::from_millis(50),
        max_attempts: 100,
    };
    let snapshots = Box::new(DirSnapshotProvider::single(commit.clone(), package_dir));
    Pipeline::start(config, snapshots, Arc::new(scripted_runner())).unwrap()
}

/// The scripted sandbox backend.
///
/// Compilations (recognized by the compiler name) "compile" by writing the name of the main
/// source into the produced binary; the later runs of that binary read the marker back and mimic
/// the behaviour the scenarios need:
///
/// - `sol.cpp` copies its stdin to its stdout (the "print input" solution);
/// - `busy.cpp` burns cpu until the sandbox kills it;
/// - `wrong.cpp` prints a wrong answer;
/// - `gen.cpp` prints `Hello World`;
/// - `val.cpp` accepts every input;
/// - `check.cpp` compares the outputs and prints a score;
/// - `badcheck.cpp` prints `oops` instead of a score.
pub fn scripted_runner() -> ScriptedSandboxRunner<impl Fn(&RunContext) -> RawRunResult + Send + Sync>
{
    ScriptedSandboxRunner(|ctx: &RunContext| match &ctx.command.command {
        BoxCommand::System(compiler) if compiler.as_os_str() == "g++" => {
            let marker = ctx
                .command
                .args
                .iter()
                .find(|arg| arg.ends_with(".cpp"))
                .cloned()
                .unwrap_or_default();
            if marker == "slowcompile.cpp" {
                // keeps the compile job in flight long enough for the coalescing scenario
                std::thread::sleep(Duration::from_millis(300));
            }
            std::fs::write(ctx.boxdir.join("compiled"), marker).unwrap();
            RawRunResult::Success(RawRunStats::with_exit_code(0))
        }
        BoxCommand::Local(program) => {
            let marker = std::fs::read_to_string(ctx.boxdir.join(program)).unwrap_or_default();
            run_program(ctx, &marker)
        }
        _ => RawRunResult::Error(format!("Unexpected command {:?}", ctx.command)),
    })
}

fn run_program(ctx: &RunContext, marker: &str) -> RawRunResult {
    match marker {
        "sol.cpp" | "slowcompile.cpp" => {
            let input = ctx
                .stdin
                .as_ref()
                .map(|path| std::fs::read(path).unwrap())
                .unwrap_or_default();
            std::fs::write(&ctx.stdout, input).unwrap();
            RawRunResult::Success(RawRunStats {
                exit_code: Some(0),
                cpu_time: 0.01,
                wall_time: 0.02,
                memory: 1024 * 1024,
                ..Default::default()
            })
        }
        "busy.cpp" => RawRunResult::Success(RawRunStats {
            exit_code: None,
            killed: true,
            cpu_time: ctx.limits.cpu_time.unwrap_or(1.0) + 0.3,
            wall_time: ctx.limits.cpu_time.unwrap_or(1.0) + 0.4,
            memory: 1024 * 1024,
            ..Default::default()
        }),
        "wrong.cpp" => {
            std::fs::write(&ctx.stdout, "A wrong answer\n").unwrap();
            RawRunResult::Success(RawRunStats::with_exit_code(0))
        }
        "gen.cpp" => {
            std::fs::write(&ctx.stdout, "Hello World\n").unwrap();
            RawRunResult::Success(RawRunStats::with_exit_code(0))
        }
        "val.cpp" => {
            std::fs::write(&ctx.stderr, "input looks fine\n").unwrap();
            RawRunResult::Success(RawRunStats::with_exit_code(0))
        }
        "check.cpp" => {
            let correct = std::fs::read(ctx.boxdir.join("correct_output")).unwrap_or_default();
            let candidate = std::fs::read(ctx.boxdir.join("test_output")).unwrap_or_default();
            let same = String::from_utf8_lossy(&correct)
                .split_whitespace()
                .eq(String::from_utf8_lossy(&candidate).split_whitespace());
            std::fs::write(&ctx.stdout, if same { "1.0\n" } else { "0.0\n" }).unwrap();
            std::fs::write(
                &ctx.stderr,
                if same { "ok\n" } else { "outputs differ\n" },
            )
            .unwrap();
            RawRunResult::Success(RawRunStats::with_exit_code(0))
        }
        "badcheck.cpp" => {
            std::fs::write(&ctx.stdout, "oops\n").unwrap();
            RawRunResult::Success(RawRunStats::with_exit_code(0))
        }
        other => RawRunResult::Error(format!("Unknown scripted program {:?}", other)),
    }
}
