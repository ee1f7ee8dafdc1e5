//! The declarative description of a problem commit, read from `info.json` at the root of the
//! snapshot.
//!
//! The manifest names every source of the package (generators, validators, checker, graders,
//! resources, solutions), the test cases with the provenance of their inputs and outputs, and the
//! subtasks with the per-solution expected verdicts.

use std::collections::HashMap;

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use taskprep_lang::LanguageManager;
use taskprep_store::SourceKind;

use crate::snapshot::Snapshot;
use crate::verdict::ExpectedVerdict;

/// The name of the manifest file inside a snapshot.
pub const MANIFEST_FILE: &str = "info.json";

/// The manifest of a problem commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemManifest {
    /// The human readable title of the problem.
    #[serde(default)]
    pub title: String,
    /// The task type driving the executions, only `Batch` is built in.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Cpu time limit of the solutions, in seconds.
    pub time_limit: f64,
    /// Memory limit of the solutions, in MiB.
    pub memory_limit: u64,
    /// The name of the model solution, producing the reference outputs.
    pub model_solution: String,
    /// The name of the checker source, `None` for the built-in white diff.
    #[serde(default)]
    pub checker: Option<String>,
    /// The names of the input generator sources.
    #[serde(default)]
    pub generators: Vec<String>,
    /// The validators with their subtask coverage.
    #[serde(default)]
    pub validators: Vec<ValidatorSpec>,
    /// The names of the graders, compiled together with the solutions.
    #[serde(default)]
    pub graders: Vec<String>,
    /// The names of the shared resource files, visible to every compilation.
    #[serde(default)]
    pub resources: Vec<String>,
    /// The solutions to grade.
    pub solutions: Vec<SolutionSpec>,
    /// The test cases of the problem.
    pub testcases: Vec<TestCaseSpec>,
    /// The subtasks grouping the test cases.
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
}

fn default_task_type() -> String {
    "Batch".into()
}

/// A validator and the subtasks it covers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSpec {
    /// The name of the validator source.
    pub name: String,
    /// Whether the validator covers every subtask.
    #[serde(default)]
    pub global: bool,
    /// The names of the covered subtasks, ignored for a global validator.
    #[serde(default)]
    pub subtasks: Vec<String>,
}

/// A solution and its declared expectation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionSpec {
    /// The name of the solution source.
    pub name: String,
    /// The language of the solution; inferred from the extension when missing.
    #[serde(default)]
    pub language: Option<String>,
    /// The expected verdict of the solution.
    pub verdict: ExpectedVerdict,
    /// Per-subtask overrides of the expected verdict.
    #[serde(default)]
    pub subtask_verdicts: HashMap<String, ExpectedVerdict>,
}

/// A test case with the provenance of its input and output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseSpec {
    /// The name of the test case.
    pub name: String,
    /// Where the input comes from.
    pub input: InputSpec,
    /// Where the reference output comes from.
    #[serde(default)]
    pub output: OutputSpec,
}

/// The provenance of a test case input.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum InputSpec {
    /// A file uploaded with the package, copied without transformations.
    Static {
        /// The path of the file inside the snapshot.
        path: String,
    },
    /// The output of a compiled generator run with fixed parameters.
    Generated {
        /// The name of the generator source.
        generator: String,
        /// The parameter string, tokenized shell-style.
        #[serde(default)]
        args: String,
    },
}

/// The provenance of a test case reference output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum OutputSpec {
    /// A file uploaded with the package.
    Static {
        /// The path of the file inside the snapshot.
        path: String,
    },
    /// Produced by running the model solution on the input.
    #[default]
    Generated,
}

/// A subtask: a named group of test cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// The name of the subtask.
    pub name: String,
    /// The score assigned to the subtask.
    #[serde(default)]
    pub score: f64,
    /// The names of the test cases belonging to the subtask.
    pub testcases: Vec<String>,
}

impl ProblemManifest {
    /// Read and validate the manifest of a snapshot.
    pub fn load(snapshot: &dyn Snapshot) -> Result<ProblemManifest, Error> {
        let content = snapshot
            .blob_at(MANIFEST_FILE)
            .context("The snapshot has no manifest")?;
        let manifest: ProblemManifest =
            serde_json::from_slice(&content).context("Invalid manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the internal consistency of the manifest.
    pub fn validate(&self) -> Result<(), Error> {
        if self.solutions.is_empty() {
            bail!("The manifest declares no solutions");
        }
        if self.testcases.is_empty() {
            bail!("The manifest declares no test cases");
        }
        if self.solution(&self.model_solution).is_none() {
            bail!(
                "The model solution {:?} is not among the solutions",
                self.model_solution
            );
        }
        let mut seen = std::collections::HashSet::new();
        for testcase in &self.testcases {
            if !seen.insert(&testcase.name) {
                bail!("Duplicated test case name {:?}", testcase.name);
            }
            if let InputSpec::Generated { generator, .. } = &testcase.input {
                if !self.generators.iter().any(|g| g == generator) {
                    bail!(
                        "Test case {:?} references the unknown generator {:?}",
                        testcase.name,
                        generator
                    );
                }
            }
        }
        for subtask in &self.subtasks {
            for name in &subtask.testcases {
                if self.testcase(name).is_none() {
                    bail!(
                        "Subtask {:?} references the unknown test case {:?}",
                        subtask.name,
                        name
                    );
                }
            }
        }
        for validator in &self.validators {
            for name in &validator.subtasks {
                if !self.subtasks.iter().any(|st| &st.name == name) {
                    bail!(
                        "Validator {:?} references the unknown subtask {:?}",
                        validator.name,
                        name
                    );
                }
            }
        }
        Ok(())
    }

    /// Look up a test case by name.
    pub fn testcase(&self, name: &str) -> Option<&TestCaseSpec> {
        self.testcases.iter().find(|tc| tc.name == name)
    }

    /// Look up a solution by name.
    pub fn solution(&self, name: &str) -> Option<&SolutionSpec> {
        self.solutions.iter().find(|sol| sol.name == name)
    }

    /// The subtasks a test case belongs to.
    pub fn subtasks_of(&self, testcase: &str) -> Vec<&SubtaskSpec> {
        self.subtasks
            .iter()
            .filter(|st| st.testcases.iter().any(|name| name == testcase))
            .collect()
    }

    /// The validators applicable to a test case: the global ones plus those covering any subtask
    /// the test case participates in.
    pub fn validators_for(&self, testcase: &str) -> Vec<&ValidatorSpec> {
        let subtasks = self.subtasks_of(testcase);
        self.validators
            .iter()
            .filter(|v| {
                v.global
                    || v.subtasks
                        .iter()
                        .any(|name| subtasks.iter().any(|st| &st.name == name))
            })
            .collect()
    }

    /// The kind of the named source, looked up across all the source lists of the manifest.
    pub fn source_kind(&self, name: &str) -> Option<SourceKind> {
        if self.generators.iter().any(|g| g == name) {
            Some(SourceKind::InputGenerator)
        } else if self.validators.iter().any(|v| v.name == name) {
            Some(SourceKind::Validator)
        } else if self.checker.as_deref() == Some(name) {
            Some(SourceKind::Checker)
        } else if self.graders.iter().any(|g| g == name) {
            Some(SourceKind::Grader)
        } else if self.resources.iter().any(|r| r == name) {
            Some(SourceKind::Resource)
        } else if self.solution(name).is_some() {
            Some(SourceKind::Solution)
        } else {
            None
        }
    }

    /// The language of a named source: the declared one for the solutions, the one inferred from
    /// the extension otherwise.
    pub fn language_of(
        &self,
        kind: SourceKind,
        name: &str,
    ) -> Option<&'static dyn taskprep_lang::Language> {
        if kind == SourceKind::Solution {
            if let Some(spec) = self.solution(name) {
                if let Some(language) = &spec.language {
                    return LanguageManager::from_name(language);
                }
            }
        }
        LanguageManager::from_file_name(name)
    }
}
