//! Invocations: running N solutions across M test cases as one observable batch.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskprep_queue::InvocationId;
use taskprep_store::{CommitId, StateFile};

use crate::manifest::ProblemManifest;
use crate::verdict::{matches_expectation, JudgeVerdict};

/// The terminal result of one (invocation, solution, test case) cell, written once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellResult {
    /// The verdict of the cell.
    pub verdict: JudgeVerdict,
    /// The score assigned by the checker, in `[0, 1]`; `None` when the solution did not produce
    /// a checkable output.
    pub score: Option<f64>,
    /// Cpu time of the solution run, in seconds.
    pub execution_time: Option<f64>,
    /// Peak memory of the solution run, in KiB.
    pub execution_memory: Option<u64>,
    /// The first line the checker printed on its standard error, meant for the contestant.
    pub contestant_message: Option<String>,
    /// The raw standard output of the checker.
    pub checker_stdout: Option<String>,
    /// The raw standard error of the checker.
    pub checker_stderr: Option<String>,
    /// A human readable explanation of the verdict.
    pub message: Option<String>,
}

impl CellResult {
    /// A result carrying only a verdict and an explanation.
    pub fn of_verdict<S: Into<String>>(verdict: JudgeVerdict, message: S) -> CellResult {
        CellResult {
            verdict,
            score: None,
            execution_time: None,
            execution_memory: None,
            contestant_message: None,
            checker_stdout: None,
            checker_stderr: None,
            message: Some(message.into()),
        }
    }
}

/// The judging state of one cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum CellState {
    /// The cell has not been picked up yet.
    #[default]
    Pending,
    /// A worker is judging the cell.
    Judging,
    /// The cell reached its terminal result.
    Done(CellResult),
}

/// One invocation: a set of solutions times a set of test cases, with the result matrix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    /// The identifier of the invocation.
    pub id: InvocationId,
    /// The commit the invocation runs against.
    pub commit: CommitId,
    /// The names of the solutions.
    pub solutions: Vec<String>,
    /// The names of the test cases.
    pub testcases: Vec<String>,
    /// The result matrix, keyed by (solution, test case).
    pub cells: HashMap<(String, String), CellState>,
    /// Cache of the per-solution validity; cleared by any fresh cell result.
    solution_validity: HashMap<String, bool>,
    /// Cache of the whole-invocation validity; cleared by any fresh cell result.
    validity: Option<bool>,
}

impl Invocation {
    /// Whether every cell reached a terminal result.
    pub fn is_complete(&self) -> bool {
        self.cells
            .values()
            .all(|cell| matches!(cell, CellState::Done(_)))
    }
}

/// Whether a terminal cell is valid: the expectation is the solution's declared verdict, overridden
/// per subtask; with overrides the cell must satisfy all of them (one per subtask it belongs to).
pub fn cell_is_valid(
    manifest: &ProblemManifest,
    solution: &str,
    testcase: &str,
    result: &CellResult,
) -> bool {
    let spec = match manifest.solution(solution) {
        Some(spec) => spec,
        None => return false,
    };
    let overrides: Vec<_> = manifest
        .subtasks_of(testcase)
        .into_iter()
        .filter_map(|subtask| spec.subtask_verdicts.get(&subtask.name))
        .collect();
    if overrides.is_empty() {
        matches_expectation(spec.verdict, result.verdict, result.score)
    } else {
        overrides
            .into_iter()
            .all(|expected| matches_expectation(*expected, result.verdict, result.score))
    }
}

/// The durable set of the invocations, persisted as one snapshot.
pub struct InvocationDb {
    invocations: Mutex<HashMap<InvocationId, Invocation>>,
    file: StateFile,
}

impl InvocationDb {
    /// Open the database, loading the persisted snapshot if present.
    pub fn open(file: StateFile) -> Result<InvocationDb, Error> {
        let invocations = file.load().context("Failed to load the invocations")?;
        Ok(InvocationDb {
            invocations: Mutex::new(invocations),
            file,
        })
    }

    /// Create a new invocation with every cell pending. At least one solution and one test case
    /// are required.
    pub fn create(
        &self,
        commit: CommitId,
        solutions: Vec<String>,
        testcases: Vec<String>,
    ) -> Result<InvocationId, Error> {
        if solutions.is_empty() {
            bail!("At least one solution must exist in an invocation");
        }
        if testcases.is_empty() {
            bail!("At least one test case must exist in an invocation");
        }
        let id = Uuid::new_v4();
        let mut cells = HashMap::new();
        for solution in &solutions {
            for testcase in &testcases {
                cells.insert(
                    (solution.clone(), testcase.clone()),
                    CellState::Pending,
                );
            }
        }
        let invocation = Invocation {
            id,
            commit,
            solutions,
            testcases,
            cells,
            solution_validity: HashMap::new(),
            validity: None,
        };
        let mut invocations = self.invocations.lock().unwrap();
        invocations.insert(id, invocation);
        self.persist(&invocations)?;
        Ok(id)
    }

    /// A snapshot of an invocation.
    pub fn get(&self, id: InvocationId) -> Option<Invocation> {
        self.invocations.lock().unwrap().get(&id).cloned()
    }

    /// Mark a cell as being judged. A terminal cell is left untouched.
    pub fn set_judging(&self, id: InvocationId, solution: &str, testcase: &str) -> Result<(), Error> {
        let mut invocations = self.invocations.lock().unwrap();
        let invocation = invocations
            .get_mut(&id)
            .with_context(|| format!("Unknown invocation {}", id))?;
        let cell = invocation
            .cells
            .get_mut(&(solution.to_string(), testcase.to_string()))
            .with_context(|| format!("Unknown cell ({}, {})", solution, testcase))?;
        if !matches!(cell, CellState::Done(_)) {
            *cell = CellState::Judging;
        }
        self.persist(&invocations)
    }

    /// Record the terminal result of a cell. The first write wins; recording over a terminal cell
    /// is ignored. Any fresh result invalidates the validity caches.
    pub fn record_result(
        &self,
        id: InvocationId,
        solution: &str,
        testcase: &str,
        result: CellResult,
    ) -> Result<(), Error> {
        let mut invocations = self.invocations.lock().unwrap();
        let invocation = invocations
            .get_mut(&id)
            .with_context(|| format!("Unknown invocation {}", id))?;
        let cell = invocation
            .cells
            .get_mut(&(solution.to_string(), testcase.to_string()))
            .with_context(|| format!("Unknown cell ({}, {})", solution, testcase))?;
        if let CellState::Done(_) = cell {
            warn!(
                "Ignoring duplicate result for cell ({}, {}) of {}",
                solution, testcase, id
            );
            return Ok(());
        }
        *cell = CellState::Done(result);
        invocation.solution_validity.remove(solution);
        invocation.validity = None;
        self.persist(&invocations)
    }

    /// Whether every terminal cell of a solution is valid and at least one is. Cached per
    /// solution until a fresh result arrives.
    pub fn solution_is_valid(
        &self,
        id: InvocationId,
        solution: &str,
        manifest: &ProblemManifest,
    ) -> Result<bool, Error> {
        let mut invocations = self.invocations.lock().unwrap();
        let invocation = invocations
            .get_mut(&id)
            .with_context(|| format!("Unknown invocation {}", id))?;
        if let Some(&valid) = invocation.solution_validity.get(solution) {
            return Ok(valid);
        }
        let mut any_valid = false;
        let mut any_invalid = false;
        for ((sol, testcase), cell) in &invocation.cells {
            if sol != solution {
                continue;
            }
            if let CellState::Done(result) = cell {
                if cell_is_valid(manifest, solution, testcase, result) {
                    any_valid = true;
                } else {
                    any_invalid = true;
                }
            }
        }
        let valid = any_valid && !any_invalid;
        invocation
            .solution_validity
            .insert(solution.to_string(), valid);
        self.persist(&invocations)?;
        Ok(valid)
    }

    /// Whether the invocation is strictly valid: for every solution at least one cell is
    /// terminal-and-valid and no cell is terminal-and-invalid. Cached until a fresh result.
    pub fn is_valid(&self, id: InvocationId, manifest: &ProblemManifest) -> Result<bool, Error> {
        {
            let invocations = self.invocations.lock().unwrap();
            let invocation = invocations
                .get(&id)
                .with_context(|| format!("Unknown invocation {}", id))?;
            if let Some(valid) = invocation.validity {
                return Ok(valid);
            }
        }
        let solutions = self
            .get(id)
            .with_context(|| format!("Unknown invocation {}", id))?
            .solutions;
        let mut valid = true;
        for solution in &solutions {
            if !self.solution_is_valid(id, solution, manifest)? {
                valid = false;
            }
        }
        let mut invocations = self.invocations.lock().unwrap();
        if let Some(invocation) = invocations.get_mut(&id) {
            invocation.validity = Some(valid);
        }
        self.persist(&invocations)?;
        Ok(valid)
    }

    fn persist(&self, invocations: &HashMap<InvocationId, Invocation>) -> Result<(), Error> {
        self.file
            .save(invocations)
            .context("Failed to persist the invocations")
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn manifest() -> ProblemManifest {
        serde_json::from_value(serde_json::json!({
            "time_limit": 1.0,
            "memory_limit": 256,
            "model_solution": "sol.cpp",
            "solutions": [
                {"name": "sol.cpp", "verdict": "model_solution"},
                {"name": "slow.cpp", "verdict": "time_limit",
                 "subtask_verdicts": {"small": "correct"}}
            ],
            "testcases": [
                {"name": "t1", "input": {"source": "static", "path": "testcase/t1.in"}},
                {"name": "t2", "input": {"source": "static", "path": "testcase/t2.in"}}
            ],
            "subtasks": [
                {"name": "small", "score": 40.0, "testcases": ["t1"]}
            ]
        }))
        .unwrap()
    }

    fn make_db(cwd: &TempDir) -> InvocationDb {
        InvocationDb::open(StateFile::new(cwd.path().join("invocations.bin"))).unwrap()
    }

    fn ok_cell(score: f64) -> CellResult {
        CellResult {
            verdict: JudgeVerdict::Ok,
            score: Some(score),
            execution_time: Some(0.1),
            execution_memory: Some(1024),
            contestant_message: None,
            checker_stdout: None,
            checker_stderr: None,
            message: None,
        }
    }

    #[test]
    fn test_create_requires_solutions_and_testcases() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        assert!(db
            .create(CommitId::new("p", "c"), vec![], vec!["t1".into()])
            .is_err());
        assert!(db
            .create(CommitId::new("p", "c"), vec!["sol.cpp".into()], vec![])
            .is_err());
    }

    #[test]
    fn test_cells_start_pending() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        let id = db
            .create(
                CommitId::new("p", "c"),
                vec!["sol.cpp".into()],
                vec!["t1".into(), "t2".into()],
            )
            .unwrap();
        let invocation = db.get(id).unwrap();
        assert_eq!(invocation.cells.len(), 2);
        assert!(invocation
            .cells
            .values()
            .all(|cell| *cell == CellState::Pending));
        assert!(!invocation.is_complete());
    }

    #[test]
    fn test_result_written_once() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        let id = db
            .create(
                CommitId::new("p", "c"),
                vec!["sol.cpp".into()],
                vec!["t1".into()],
            )
            .unwrap();
        db.record_result(id, "sol.cpp", "t1", ok_cell(1.0)).unwrap();
        db.record_result(id, "sol.cpp", "t1", ok_cell(0.0)).unwrap();
        let invocation = db.get(id).unwrap();
        assert_eq!(
            invocation.cells[&("sol.cpp".to_string(), "t1".to_string())],
            CellState::Done(ok_cell(1.0))
        );
    }

    #[test]
    fn test_strict_validity() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        let manifest = manifest();
        let id = db
            .create(
                CommitId::new("p", "c"),
                vec!["sol.cpp".into()],
                vec!["t1".into(), "t2".into()],
            )
            .unwrap();
        // no terminal cell: not valid yet
        assert!(!db.is_valid(id, &manifest).unwrap());
        db.record_result(id, "sol.cpp", "t1", ok_cell(1.0)).unwrap();
        assert!(db.is_valid(id, &manifest).unwrap());
        db.record_result(id, "sol.cpp", "t2", ok_cell(0.0)).unwrap();
        assert!(!db.is_valid(id, &manifest).unwrap());
    }

    #[test]
    fn test_subtask_override() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        let manifest = manifest();
        // slow.cpp expects time_limit globally, but correct on subtask small (containing t1)
        let id = db
            .create(
                CommitId::new("p", "c"),
                vec!["slow.cpp".into()],
                vec!["t1".into(), "t2".into()],
            )
            .unwrap();
        db.record_result(id, "slow.cpp", "t1", ok_cell(1.0)).unwrap();
        db.record_result(
            id,
            "slow.cpp",
            "t2",
            CellResult::of_verdict(JudgeVerdict::TimeLimitExceeded, "tle"),
        )
        .unwrap();
        assert!(db.is_valid(id, &manifest).unwrap());
    }

    #[test]
    fn test_cell_is_valid_uses_override() {
        let manifest = manifest();
        // t1 belongs to subtask small, where slow.cpp is expected correct
        assert!(cell_is_valid(&manifest, "slow.cpp", "t1", &ok_cell(1.0)));
        assert!(!cell_is_valid(
            &manifest,
            "slow.cpp",
            "t1",
            &CellResult::of_verdict(JudgeVerdict::TimeLimitExceeded, "tle")
        ));
        // t2 has no override: the global expectation applies
        assert!(cell_is_valid(
            &manifest,
            "slow.cpp",
            "t2",
            &CellResult::of_verdict(JudgeVerdict::TimeLimitExceeded, "tle")
        ));
    }
}
