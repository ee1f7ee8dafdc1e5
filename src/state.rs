//! The mutable per-commit state: compilation results, generated artifacts, validation verdicts.
//!
//! The state is a single snapshot persisted atomically on every mutation, so the cascade of an
//! invalidation is observed as one transaction. A monotonically increasing epoch is bumped by
//! every invalidation: a job records the epoch when it starts and commits its artifacts only if
//! the epoch is unchanged, discarding the output of a stale run.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Error};
use serde::{Deserialize, Serialize};

use taskprep_queue::TargetRef;
use taskprep_store::{CommitId, CommitStore, FileKey, SourceKind, StateFile};

use crate::manifest::{OutputSpec, ProblemManifest};

/// The persisted outcome of a pipeline step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    /// The step has not produced a terminal outcome yet.
    #[default]
    Pending,
    /// The step completed successfully.
    Ok,
    /// The step failed deterministically.
    Failed,
}

impl StepOutcome {
    /// Whether the step completed successfully.
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok)
    }
}

/// The full observable state of a step, combining the persisted outcome with the state of the
/// active job, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// No outcome and no active job.
    None,
    /// A job is published for the step.
    Queued,
    /// A worker is running the step.
    Running,
    /// The step completed successfully.
    Ok,
    /// The step failed.
    Failed,
}

/// The compilation state of a named source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceState {
    /// The outcome of the compilation.
    pub compilation: StepOutcome,
    /// The key of the compiled artifact; non-null iff the compilation succeeded.
    pub compiled: Option<FileKey>,
    /// The stdout and stderr of the last compilation, stored verbatim.
    pub compile_log: Option<String>,
    /// A human readable explanation of a failure.
    pub message: Option<String>,
}

/// The generation state of a test case.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestCaseState {
    /// The outcome of the input generation.
    pub input_gen: StepOutcome,
    /// The key of the input artifact; non-null iff the generation succeeded.
    pub input: Option<FileKey>,
    /// A human readable explanation of an input generation failure.
    pub input_message: Option<String>,
    /// The outcome of the reference output generation.
    pub output_gen: StepOutcome,
    /// The key of the output artifact; non-null iff the generation succeeded.
    pub output: Option<FileKey>,
    /// A human readable explanation of an output generation failure.
    pub output_message: Option<String>,
    /// Whether the test case has been registered with the judge.
    pub judge_init: StepOutcome,
}

/// The verdict of one validator on one test case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationState {
    /// The validation has not run yet.
    #[default]
    Pending,
    /// The input is valid.
    Valid {
        /// The message printed by the validator.
        message: String,
    },
    /// The input is invalid.
    Invalid {
        /// The message printed by the validator.
        message: String,
    },
}

/// The state fields of one problem commit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitState {
    /// Bumped by every invalidation; stale jobs detect the bump and discard their outputs.
    pub epoch: u64,
    /// The outcome of the judge initialization of the commit.
    pub judge_init: StepOutcome,
    /// A human readable explanation of a judge initialization failure.
    pub judge_init_message: Option<String>,
    /// The compilation state of every touched source, keyed by kind and name.
    pub sources: HashMap<(SourceKind, String), SourceState>,
    /// The generation state of every touched test case, keyed by name.
    pub testcases: HashMap<String, TestCaseState>,
    /// The validation verdicts, keyed by (validator, test case).
    pub validations: HashMap<(String, String), ValidationState>,
}

impl CommitState {
    /// The state of a source, defaulting to the untouched state.
    pub fn source(&self, kind: SourceKind, name: &str) -> SourceState {
        self.sources
            .get(&(kind, name.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// The mutable state of a source.
    pub fn source_mut(&mut self, kind: SourceKind, name: &str) -> &mut SourceState {
        self.sources.entry((kind, name.to_string())).or_default()
    }

    /// The state of a test case, defaulting to the untouched state.
    pub fn testcase(&self, name: &str) -> TestCaseState {
        self.testcases.get(name).cloned().unwrap_or_default()
    }

    /// The mutable state of a test case.
    pub fn testcase_mut(&mut self, name: &str) -> &mut TestCaseState {
        self.testcases.entry(name.to_string()).or_default()
    }
}

/// The durable state of one problem commit, mutated under a single lock and persisted atomically:
/// every closure passed to [`mutate`](CommitStateDb::mutate) is one transaction.
pub struct CommitStateDb {
    commit: CommitId,
    state: Mutex<CommitState>,
    file: StateFile,
    commit_store: CommitStore,
}

impl CommitStateDb {
    /// Open the state of a commit, loading the persisted snapshot if present.
    pub fn open(commit: CommitId, commit_store: CommitStore) -> Result<CommitStateDb, Error> {
        let file = StateFile::new(commit_store.commit_dir(&commit).join("state.bin"));
        let state = file.load().context("Failed to load the commit state")?;
        Ok(CommitStateDb {
            commit,
            state: Mutex::new(state),
            file,
            commit_store,
        })
    }

    /// The commit this state belongs to.
    pub fn commit(&self) -> &CommitId {
        &self.commit
    }

    /// Read the state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&CommitState) -> R) -> R {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    /// The current invalidation epoch.
    pub fn epoch(&self) -> u64 {
        self.read(|s| s.epoch)
    }

    /// Mutate the state and persist the result as one transaction.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut CommitState) -> R) -> Result<R, Error> {
        let mut state = self.state.lock().unwrap();
        let result = f(&mut state);
        self.file
            .save(&*state)
            .context("Failed to persist the commit state")?;
        Ok(result)
    }

    /// Mutate the state only if no invalidation happened since `epoch` was read. Returns whether
    /// the mutation was applied; a stale job observes `false` and discards its output.
    pub fn commit_if_current<R>(
        &self,
        epoch: u64,
        f: impl FnOnce(&mut CommitState) -> R,
    ) -> Result<Option<R>, Error> {
        let mut state = self.state.lock().unwrap();
        if state.epoch != epoch {
            debug!(
                "Discarding stale write for {} (epoch {} != {})",
                self.commit, epoch, state.epoch
            );
            return Ok(None);
        }
        let result = f(&mut state);
        self.file
            .save(&*state)
            .context("Failed to persist the commit state")?;
        Ok(Some(result))
    }

    /// Mark the artifacts of a target and of every transitive dependent as stale, in one
    /// transaction. Invalidation is idempotent.
    pub fn invalidate(&self, target: &TargetRef, manifest: &ProblemManifest) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.epoch += 1;
        match target {
            TargetRef::Problem { .. } => {
                state.judge_init = StepOutcome::Pending;
                state.judge_init_message = None;
                let names: Vec<_> = state.testcases.keys().cloned().collect();
                for name in names {
                    self.clear_output(&mut state, manifest, &name);
                    state.testcase_mut(&name).judge_init = StepOutcome::Pending;
                }
            }
            TargetRef::Source { kind, name, .. } => {
                self.clear_source(&mut state, *kind, name)?;
                match kind {
                    SourceKind::InputGenerator => {
                        for testcase in &manifest.testcases {
                            if let crate::manifest::InputSpec::Generated { generator, .. } =
                                &testcase.input
                            {
                                if generator == name {
                                    self.clear_input(&mut state, manifest, &testcase.name);
                                }
                            }
                        }
                    }
                    SourceKind::Solution if *name == manifest.model_solution => {
                        for testcase in &manifest.testcases {
                            self.clear_output(&mut state, manifest, &testcase.name);
                        }
                    }
                    SourceKind::Validator => {
                        for ((validator, _), validation) in state.validations.iter_mut() {
                            if validator == name {
                                *validation = ValidationState::Pending;
                            }
                        }
                    }
                    SourceKind::Resource | SourceKind::Grader => {
                        // shared by every compilation: everything downstream goes
                        let sources: Vec<_> = state.sources.keys().cloned().collect();
                        for (kind, name) in sources {
                            self.clear_source(&mut state, kind, &name)?;
                        }
                        let names: Vec<_> = state.testcases.keys().cloned().collect();
                        for testcase in names {
                            self.clear_input(&mut state, manifest, &testcase);
                        }
                    }
                    _ => {}
                }
            }
            TargetRef::TestCaseInput { testcase, .. } => {
                self.clear_input(&mut state, manifest, testcase);
            }
            TargetRef::TestCaseOutput { testcase, .. } => {
                self.clear_output(&mut state, manifest, testcase);
            }
            TargetRef::Validation {
                validator,
                testcase,
                ..
            } => {
                state
                    .validations
                    .insert((validator.clone(), testcase.clone()), ValidationState::Pending);
            }
            TargetRef::Cell { .. } => {
                // cells are written once; a new invocation re-judges them
            }
        }
        self.file
            .save(&*state)
            .context("Failed to persist the commit state")?;
        Ok(())
    }

    /// Clear the compiled artifact of a source.
    fn clear_source(
        &self,
        state: &mut CommitState,
        kind: SourceKind,
        name: &str,
    ) -> Result<(), Error> {
        *state.source_mut(kind, name) = SourceState::default();
        self.commit_store
            .remove_descriptor(&self.commit, kind, name)?;
        Ok(())
    }

    /// Clear the input of a test case and everything derived from it.
    fn clear_input(&self, state: &mut CommitState, manifest: &ProblemManifest, testcase: &str) {
        {
            let tc = state.testcase_mut(testcase);
            tc.input_gen = StepOutcome::Pending;
            tc.input = None;
            tc.input_message = None;
        }
        for ((_, tc_name), validation) in state.validations.iter_mut() {
            if tc_name == testcase {
                *validation = ValidationState::Pending;
            }
        }
        self.clear_output(state, manifest, testcase);
    }

    /// Clear the reference output of a test case, unless it is static.
    fn clear_output(&self, state: &mut CommitState, manifest: &ProblemManifest, testcase: &str) {
        let is_static = matches!(
            manifest.testcase(testcase).map(|tc| &tc.output),
            Some(OutputSpec::Static { .. })
        );
        if is_static {
            return;
        }
        let tc = state.testcase_mut(testcase);
        tc.output_gen = StepOutcome::Pending;
        tc.output = None;
        tc.output_message = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use crate::manifest::ProblemManifest;

    use super::*;

    fn manifest() -> ProblemManifest {
        serde_json::from_value(serde_json::json!({
            "time_limit": 1.0,
            "memory_limit": 256,
            "model_solution": "sol.cpp",
            "generators": ["gen.cpp"],
            "solutions": [{"name": "sol.cpp", "verdict": "model_solution"}],
            "testcases": [
                {"name": "t1",
                 "input": {"source": "generated", "generator": "gen.cpp"}},
                {"name": "t2",
                 "input": {"source": "static", "path": "testcase/t2.in"},
                 "output": {"source": "static", "path": "testcase/t2.out"}}
            ]
        }))
        .unwrap()
    }

    fn make_db(cwd: &TempDir) -> CommitStateDb {
        let commit = CommitId::new("p", "abcdef");
        let commit_store = CommitStore::new(cwd.path());
        CommitStateDb::open(commit, commit_store).unwrap()
    }

    fn fill_green(db: &CommitStateDb) {
        db.mutate(|s| {
            s.judge_init = StepOutcome::Ok;
            let src = s.source_mut(SourceKind::Solution, "sol.cpp");
            src.compilation = StepOutcome::Ok;
            src.compiled = Some(FileKey::from_content(b"bin"));
            let gen = s.source_mut(SourceKind::InputGenerator, "gen.cpp");
            gen.compilation = StepOutcome::Ok;
            gen.compiled = Some(FileKey::from_content(b"genbin"));
            for name in ["t1", "t2"] {
                let tc = s.testcase_mut(name);
                tc.input_gen = StepOutcome::Ok;
                tc.input = Some(FileKey::from_content(b"in"));
                tc.output_gen = StepOutcome::Ok;
                tc.output = Some(FileKey::from_content(b"out"));
                tc.judge_init = StepOutcome::Ok;
            }
            s.validations.insert(
                ("val.cpp".into(), "t1".into()),
                ValidationState::Valid { message: "ok".into() },
            );
        })
        .unwrap();
    }

    #[test]
    fn test_persist_roundtrip() {
        let cwd = TempDir::new().unwrap();
        {
            let db = make_db(&cwd);
            fill_green(&db);
        }
        let db = make_db(&cwd);
        assert!(db.read(|s| s.judge_init.is_ok()));
        assert!(db.read(|s| s.testcase("t1").input.is_some()));
    }

    #[test]
    fn test_invalidate_model_solution_clears_generated_outputs() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        fill_green(&db);
        let target = TargetRef::Source {
            commit: db.commit().clone(),
            kind: SourceKind::Solution,
            name: "sol.cpp".into(),
        };
        db.invalidate(&target, &manifest()).unwrap();
        let state = db.read(|s| s.clone());
        // the solution itself is cleared
        assert_eq!(
            state.source(SourceKind::Solution, "sol.cpp").compilation,
            StepOutcome::Pending
        );
        // every non-static output is cleared, the static one survives
        assert_eq!(state.testcase("t1").output_gen, StepOutcome::Pending);
        assert_eq!(state.testcase("t1").output, None);
        assert_eq!(state.testcase("t2").output_gen, StepOutcome::Ok);
        // inputs are untouched
        assert_eq!(state.testcase("t1").input_gen, StepOutcome::Ok);
    }

    #[test]
    fn test_invalidate_generator_cascades_to_input_and_output() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        fill_green(&db);
        let target = TargetRef::Source {
            commit: db.commit().clone(),
            kind: SourceKind::InputGenerator,
            name: "gen.cpp".into(),
        };
        db.invalidate(&target, &manifest()).unwrap();
        let state = db.read(|s| s.clone());
        assert_eq!(state.testcase("t1").input_gen, StepOutcome::Pending);
        assert_eq!(state.testcase("t1").input, None);
        assert_eq!(state.testcase("t1").output_gen, StepOutcome::Pending);
        assert_eq!(
            state.validations[&("val.cpp".to_string(), "t1".to_string())],
            ValidationState::Pending
        );
        // t2 is static, nothing to clear
        assert_eq!(state.testcase("t2").input_gen, StepOutcome::Ok);
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        fill_green(&db);
        let target = TargetRef::TestCaseInput {
            commit: db.commit().clone(),
            testcase: "t1".into(),
        };
        db.invalidate(&target, &manifest()).unwrap();
        let once = db.read(|s| s.clone());
        db.invalidate(&target, &manifest()).unwrap();
        let twice = db.read(|s| s.clone());
        // the epoch moves, everything else is identical
        assert_eq!(once.testcases["t1"].input_gen, twice.testcases["t1"].input_gen);
        assert_eq!(once.testcases["t1"].input, twice.testcases["t1"].input);
        assert_eq!(once.testcases["t1"].output, twice.testcases["t1"].output);
        assert_eq!(
            once.validations[&("val.cpp".to_string(), "t1".to_string())],
            twice.validations[&("val.cpp".to_string(), "t1".to_string())]
        );
    }

    #[test]
    fn test_commit_if_current_discards_stale_write() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        fill_green(&db);
        let epoch = db.epoch();
        let target = TargetRef::TestCaseInput {
            commit: db.commit().clone(),
            testcase: "t1".into(),
        };
        db.invalidate(&target, &manifest()).unwrap();
        let written = db
            .commit_if_current(epoch, |s| {
                s.testcase_mut("t1").input = Some(FileKey::from_content(b"stale"));
            })
            .unwrap();
        assert!(written.is_none());
        assert_eq!(db.read(|s| s.testcase("t1").input), None);
    }

    #[test]
    fn test_invalidate_problem_clears_judge_init() {
        let cwd = TempDir::new().unwrap();
        let db = make_db(&cwd);
        fill_green(&db);
        let target = TargetRef::Problem {
            commit: db.commit().clone(),
        };
        db.invalidate(&target, &manifest()).unwrap();
        let state = db.read(|s| s.clone());
        assert_eq!(state.judge_init, StepOutcome::Pending);
        assert_eq!(state.testcase("t1").judge_init, StepOutcome::Pending);
        assert_eq!(state.testcase("t1").output_gen, StepOutcome::Pending);
    }
}
