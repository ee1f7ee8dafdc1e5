#[macro_use]
extern crate log;

mod opt;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Error};
use clap::Parser;
use itertools::Itertools;

use taskprep::invocation::CellState;
use taskprep::snapshot::DirSnapshotProvider;
use taskprep::state::{StepOutcome, ValidationState};
use taskprep::{Pipeline, PipelineConfig};
use taskprep_queue::{JobType, TargetRef};
use taskprep_sandbox::TaboxRunner;

use crate::opt::{parse_target, Command, Opt};

/// How long to wait for a batch of jobs before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

fn main() {
    env_logger::Builder::from_default_env()
        .format_timestamp_nanos()
        .init();
    let opt = Opt::parse();
    if let Err(e) = run(opt) {
        eprintln!("Error: {:?}", e);
        std::process::exit(1);
    }
}

fn run(opt: Opt) -> Result<(), Error> {
    let commit = opt.commit_id()?;
    let mut config = PipelineConfig::new(opt.store_dir()?);
    if let Some(workers) = opt.workers {
        config.workers = workers;
    }
    let snapshots = Box::new(DirSnapshotProvider::single(
        commit.clone(),
        opt.task_dir.clone(),
    ));
    let pipeline = Pipeline::start(config, snapshots, Arc::new(TaboxRunner))?;

    match &opt.command {
        Command::Generate => generate(&pipeline, &commit)?,
        Command::Invoke {
            solutions,
            testcases,
        } => invoke(&pipeline, &commit, solutions, testcases)?,
        Command::Invalidate { target } => {
            let target = parse_target(&commit, target)?;
            pipeline.invalidate(&target)?;
            println!("Invalidated {}", target);
        }
    }
    pipeline.shutdown();
    Ok(())
}

/// Generate and validate all the test data, then print a per-testcase report.
fn generate(pipeline: &Pipeline, commit: &taskprep_store::CommitId) -> Result<(), Error> {
    let manifest = pipeline.context().manifest(commit)?;
    pipeline.generate_all(commit)?;
    for testcase in &manifest.testcases {
        let input = TargetRef::TestCaseInput {
            commit: commit.clone(),
            testcase: testcase.name.clone(),
        };
        let output = TargetRef::TestCaseOutput {
            commit: commit.clone(),
            testcase: testcase.name.clone(),
        };
        pipeline.wait(&input, JobType::GenerateInput, WAIT_TIMEOUT);
        pipeline.wait(&output, JobType::GenerateOutput, WAIT_TIMEOUT);
        for validator in manifest.validators_for(&testcase.name) {
            let validation = TargetRef::Validation {
                commit: commit.clone(),
                validator: validator.name.clone(),
                testcase: testcase.name.clone(),
            };
            pipeline.wait(&validation, JobType::Validate, WAIT_TIMEOUT);
        }
    }

    let state = pipeline.context().state(commit)?;
    for testcase in &manifest.testcases {
        let tc = state.read(|s| s.testcase(&testcase.name));
        let input = step_mark(tc.input_gen, tc.input_message.as_deref());
        let output = step_mark(tc.output_gen, tc.output_message.as_deref());
        let validations = state.read(|s| {
            manifest
                .validators_for(&testcase.name)
                .into_iter()
                .map(|v| {
                    let verdict = s
                        .validations
                        .get(&(v.name.clone(), testcase.name.clone()))
                        .cloned()
                        .unwrap_or_default();
                    match verdict {
                        ValidationState::Pending => format!("{}: pending", v.name),
                        ValidationState::Valid { .. } => format!("{}: valid", v.name),
                        ValidationState::Invalid { message } => {
                            format!("{}: INVALID ({})", v.name, message)
                        }
                    }
                })
                .join(", ")
        });
        println!(
            "{:12} input: {:24} output: {:24} {}",
            testcase.name, input, output, validations
        );
    }
    Ok(())
}

fn step_mark(outcome: StepOutcome, message: Option<&str>) -> String {
    match outcome {
        StepOutcome::Ok => "ok".into(),
        StepOutcome::Pending => "pending".into(),
        StepOutcome::Failed => format!("FAILED ({})", message.unwrap_or("unknown")),
    }
}

/// Run an invocation and print the result matrix with the validity summary.
fn invoke(
    pipeline: &Pipeline,
    commit: &taskprep_store::CommitId,
    solutions: &[String],
    testcases: &[String],
) -> Result<(), Error> {
    let manifest = pipeline.context().manifest(commit)?;
    let solutions: Vec<String> = if solutions.is_empty() {
        manifest.solutions.iter().map(|s| s.name.clone()).collect()
    } else {
        solutions.to_vec()
    };
    let testcases: Vec<String> = if testcases.is_empty() {
        manifest.testcases.iter().map(|t| t.name.clone()).collect()
    } else {
        testcases.to_vec()
    };

    let id = pipeline.create_invocation(commit, solutions, testcases)?;
    info!("Created invocation {}", id);
    pipeline.run_invocation(id)?;
    let invocation = pipeline.wait_invocation(id, WAIT_TIMEOUT)?;

    for solution in &invocation.solutions {
        println!("{}", solution);
        for testcase in &invocation.testcases {
            let cell = invocation
                .cells
                .get(&(solution.clone(), testcase.clone()))
                .cloned()
                .unwrap_or_default();
            let line = match cell {
                CellState::Pending => "pending".to_string(),
                CellState::Judging => "judging".to_string(),
                CellState::Done(result) => {
                    let score = result
                        .score
                        .map(|s| format!("{:.2}", s))
                        .unwrap_or_else(|| "-".into());
                    let time = result
                        .execution_time
                        .map(|t| format!("{:.3}s", t))
                        .unwrap_or_else(|| "-".into());
                    format!("{:24} score: {:5} time: {}", result.verdict.to_string(), score, time)
                }
            };
            println!("    {:12} {}", testcase, line);
        }
        let valid = pipeline
            .context()
            .invocations
            .solution_is_valid(id, solution, &manifest)
            .context("Failed to compute the solution validity")?;
        println!("    => {}", if valid { "valid" } else { "NOT VALID" });
    }
    let valid = pipeline.invocation_is_valid(id)?;
    println!(
        "Invocation {}: {}",
        id,
        if valid { "valid" } else { "NOT VALID" }
    );
    Ok(())
}
