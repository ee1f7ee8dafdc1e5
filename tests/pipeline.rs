//! End-to-end scenarios of the preparation pipeline, driven through the scripted sandbox backend.

mod common;

use approx::assert_abs_diff_eq;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use taskprep::invocation::CellState;
use taskprep::state::{StepOutcome, StepState, ValidationState};
use taskprep::verdict::JudgeVerdict;
use taskprep_queue::{JobType, TargetRef};
use taskprep_store::{CommitId, SourceKind};

use common::{start_pipeline, write_package, WAIT};

fn commit() -> CommitId {
    CommitId::new("aplusb", "0123456789abcdef")
}

/// A commit with a "print input" model solution, a generator emitting `Hello World`, a static
/// reference output and an identity checker.
fn trivial_manifest() -> serde_json::Value {
    serde_json::json!({
        "title": "Trivial batch",
        "time_limit": 1.0,
        "memory_limit": 256,
        "model_solution": "sol.cpp",
        "checker": "check.cpp",
        "generators": ["gen.cpp"],
        "validators": [{"name": "val.cpp", "global": true}],
        "solutions": [{"name": "sol.cpp", "verdict": "correct"}],
        "testcases": [
            {"name": "t1",
             "input": {"source": "generated", "generator": "gen.cpp", "args": "seed 42"},
             "output": {"source": "static", "path": "testcase/t1.out"}}
        ]
    })
}

fn trivial_files() -> Vec<(&'static str, &'static str)> {
    vec![
        ("solution/sol.cpp", "// copies stdin to stdout"),
        ("inputgenerator/gen.cpp", "// prints Hello World"),
        ("validator/val.cpp", "// accepts everything"),
        ("checker/check.cpp", "// compares the outputs"),
        ("testcase/t1.out", "Hello World\n"),
    ]
}

#[test]
fn test_trivial_batch() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    write_package(&package, &trivial_manifest(), &trivial_files());
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    let id = pipeline
        .create_invocation(&commit(), vec!["sol.cpp".into()], vec!["t1".into()])
        .unwrap();
    pipeline.run_invocation(id).unwrap();
    let invocation = pipeline.wait_invocation(id, WAIT).unwrap();

    let cell = &invocation.cells[&("sol.cpp".to_string(), "t1".to_string())];
    let CellState::Done(result) = cell else {
        panic!("The cell did not terminate: {:?}", cell);
    };
    assert_eq!(result.verdict, JudgeVerdict::Ok);
    assert_abs_diff_eq!(result.score.unwrap(), 1.0);
    assert!(pipeline.invocation_is_valid(id).unwrap());

    // the generated input is the generator's stdout
    let state = pipeline.context().state(&commit()).unwrap();
    let input = state.read(|s| s.testcase("t1").input).unwrap();
    let content = pipeline
        .context()
        .file_store
        .get(&input)
        .unwrap()
        .read_contents()
        .unwrap();
    assert_eq!(content, b"Hello World\n");

    // the validation fanned out from the input generation
    let validation = TargetRef::Validation {
        commit: commit(),
        validator: "val.cpp".into(),
        testcase: "t1".into(),
    };
    pipeline.wait(&validation, JobType::Validate, WAIT);
    let verdict = state.read(|s| s.validations[&("val.cpp".to_string(), "t1".to_string())].clone());
    assert_eq!(
        verdict,
        ValidationState::Valid {
            message: "input looks fine".into()
        }
    );
    pipeline.shutdown();
}

#[test]
fn test_tle_detection() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    let manifest = serde_json::json!({
        "time_limit": 0.5,
        "memory_limit": 256,
        "model_solution": "sol.cpp",
        "solutions": [
            {"name": "sol.cpp", "verdict": "model_solution"},
            {"name": "busy.cpp", "verdict": "time_limit"}
        ],
        "testcases": [
            {"name": "t1", "input": {"source": "static", "path": "testcase/t1.in"}}
        ]
    });
    write_package(
        &package,
        &manifest,
        &[
            ("solution/sol.cpp", "// copies stdin to stdout"),
            ("solution/busy.cpp", "// busy loop"),
            ("testcase/t1.in", "1 2\n"),
        ],
    );
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    let id = pipeline
        .create_invocation(&commit(), vec!["busy.cpp".into()], vec!["t1".into()])
        .unwrap();
    pipeline.run_invocation(id).unwrap();
    let invocation = pipeline.wait_invocation(id, WAIT).unwrap();

    let CellState::Done(result) = &invocation.cells[&("busy.cpp".to_string(), "t1".to_string())]
    else {
        panic!("The cell did not terminate");
    };
    assert_eq!(result.verdict, JudgeVerdict::TimeLimitExceeded);
    // the expected verdict is time_limit, so the cell is valid
    assert!(pipeline.invocation_is_valid(id).unwrap());
    pipeline.shutdown();
}

#[test]
fn test_checker_contract_violation() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    let mut manifest = trivial_manifest();
    manifest["checker"] = "badcheck.cpp".into();
    let mut files = trivial_files();
    files.push(("checker/badcheck.cpp", "// prints oops"));
    write_package(&package, &manifest, &files);
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    let id = pipeline
        .create_invocation(&commit(), vec!["sol.cpp".into()], vec!["t1".into()])
        .unwrap();
    pipeline.run_invocation(id).unwrap();
    let invocation = pipeline.wait_invocation(id, WAIT).unwrap();

    let CellState::Done(result) = &invocation.cells[&("sol.cpp".to_string(), "t1".to_string())]
    else {
        panic!("The cell did not terminate");
    };
    assert_eq!(result.verdict, JudgeVerdict::CheckerFailed);
    assert!(!pipeline.invocation_is_valid(id).unwrap());
    pipeline.shutdown();
}

#[test]
fn test_invalidate_cascades_and_regenerates() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    // white-diff checker, generated output from the model solution
    let manifest = serde_json::json!({
        "time_limit": 1.0,
        "memory_limit": 256,
        "model_solution": "sol.cpp",
        "generators": ["gen.cpp"],
        "solutions": [{"name": "sol.cpp", "verdict": "model_solution"}],
        "testcases": [
            {"name": "t1",
             "input": {"source": "generated", "generator": "gen.cpp"}}
        ]
    });
    write_package(
        &package,
        &manifest,
        &[
            ("solution/sol.cpp", "// copies stdin to stdout"),
            ("inputgenerator/gen.cpp", "// prints Hello World"),
        ],
    );
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    // everything green
    let output_target = TargetRef::TestCaseOutput {
        commit: commit(),
        testcase: "t1".into(),
    };
    pipeline.generate_all(&commit()).unwrap();
    let status = pipeline
        .wait(&output_target, JobType::GenerateOutput, WAIT)
        .unwrap();
    assert!(status.is_success());
    let state = pipeline.context().state(&commit()).unwrap();
    assert_eq!(state.read(|s| s.testcase("t1").output_gen), StepOutcome::Ok);

    // invalidating the model solution clears the generated output
    let target = TargetRef::Source {
        commit: commit(),
        kind: SourceKind::Solution,
        name: "sol.cpp".into(),
    };
    pipeline.invalidate(&target).unwrap();
    assert_eq!(
        state.read(|s| s.testcase("t1").output_gen),
        StepOutcome::Pending
    );
    assert_eq!(state.read(|s| s.testcase("t1").output), None);

    // a subsequent run regenerates the output before resuming the solutions
    let id = pipeline
        .create_invocation(&commit(), vec!["sol.cpp".into()], vec!["t1".into()])
        .unwrap();
    pipeline.run_invocation(id).unwrap();
    let invocation = pipeline.wait_invocation(id, WAIT).unwrap();
    let CellState::Done(result) = &invocation.cells[&("sol.cpp".to_string(), "t1".to_string())]
    else {
        panic!("The cell did not terminate");
    };
    assert_eq!(result.verdict, JudgeVerdict::Ok);
    assert_eq!(result.score, Some(1.0));
    assert_eq!(state.read(|s| s.testcase("t1").output_gen), StepOutcome::Ok);
    pipeline.shutdown();
}

#[test]
fn test_duplicate_compile_requests_coalesce() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    let manifest = serde_json::json!({
        "time_limit": 1.0,
        "memory_limit": 256,
        "model_solution": "slowcompile.cpp",
        "solutions": [{"name": "slowcompile.cpp", "verdict": "model_solution"}],
        "testcases": [
            {"name": "t1", "input": {"source": "static", "path": "testcase/t1.in"}}
        ]
    });
    write_package(
        &package,
        &manifest,
        &[
            ("solution/slowcompile.cpp", "// compiles slowly"),
            ("testcase/t1.in", "1 2\n"),
        ],
    );
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    let target = TargetRef::Source {
        commit: commit(),
        kind: SourceKind::Solution,
        name: "slowcompile.cpp".into(),
    };
    let id1 = pipeline.request(target.clone(), JobType::Compile).unwrap();
    let id2 = pipeline.request(target.clone(), JobType::Compile).unwrap();
    assert_eq!(id1, id2);
    let status = pipeline.wait(&target, JobType::Compile, WAIT).unwrap();
    assert!(status.is_success());
    assert_eq!(
        pipeline
            .compilation_state(&commit(), SourceKind::Solution, "slowcompile.cpp")
            .unwrap(),
        StepState::Ok
    );
    pipeline.shutdown();
}

#[test]
fn test_unsupported_language() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    let manifest = serde_json::json!({
        "time_limit": 1.0,
        "memory_limit": 256,
        "model_solution": "sol.cpp",
        "solutions": [
            {"name": "sol.cpp", "verdict": "model_solution"},
            {"name": "weird.xyz", "verdict": "correct"}
        ],
        "testcases": [
            {"name": "t1",
             "input": {"source": "static", "path": "testcase/t1.in"},
             "output": {"source": "static", "path": "testcase/t1.out"}}
        ]
    });
    write_package(
        &package,
        &manifest,
        &[
            ("solution/sol.cpp", "// copies stdin to stdout"),
            ("solution/weird.xyz", "whatever"),
            ("testcase/t1.in", "1 2\n"),
            ("testcase/t1.out", "1 2\n"),
        ],
    );
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    let id = pipeline
        .create_invocation(&commit(), vec!["weird.xyz".into()], vec!["t1".into()])
        .unwrap();
    pipeline.run_invocation(id).unwrap();
    let invocation = pipeline.wait_invocation(id, WAIT).unwrap();

    let CellState::Done(result) = &invocation.cells[&("weird.xyz".to_string(), "t1".to_string())]
    else {
        panic!("The cell did not terminate");
    };
    assert_eq!(result.verdict, JudgeVerdict::InvalidSubmission);
    // no compilation was ever attempted for the unsupported solution
    let compile_target = TargetRef::Source {
        commit: commit(),
        kind: SourceKind::Solution,
        name: "weird.xyz".into(),
    };
    assert_eq!(pipeline.status(&compile_target, JobType::Compile), None);
    assert!(!pipeline.invocation_is_valid(id).unwrap());
    pipeline.shutdown();
}

#[test]
fn test_generator_inputs_are_deterministic() {
    let cwd = TempDir::new().unwrap();
    let package = cwd.path().join("package");
    std::fs::create_dir_all(&package).unwrap();
    write_package(&package, &trivial_manifest(), &trivial_files());
    let pipeline = start_pipeline(&cwd.path().join("store"), &commit(), &package);

    let target = TargetRef::TestCaseInput {
        commit: commit(),
        testcase: "t1".into(),
    };
    pipeline.request(target.clone(), JobType::GenerateInput).unwrap();
    pipeline.wait(&target, JobType::GenerateInput, WAIT).unwrap();
    let state = pipeline.context().state(&commit()).unwrap();
    let first = state.read(|s| s.testcase("t1").input).unwrap();

    // repeated invalidate+request cycles produce byte-identical inputs
    for _ in 0..2 {
        pipeline.invalidate(&target).unwrap();
        assert_eq!(state.read(|s| s.testcase("t1").input), None);
        pipeline.request(target.clone(), JobType::GenerateInput).unwrap();
        let status = pipeline.wait(&target, JobType::GenerateInput, WAIT).unwrap();
        assert!(status.is_success());
        let again = state.read(|s| s.testcase("t1").input).unwrap();
        assert_eq!(again, first);
    }
    pipeline.shutdown();
}
