use std::path::PathBuf;

use anyhow::{bail, Error};
use clap::{Parser, Subcommand};

use taskprep_queue::TargetRef;
use taskprep_store::{CommitId, SourceKind};

#[derive(Parser, Debug)]
#[clap(name = "taskprep", version, about = "Prepare and judge a problem package")]
pub struct Opt {
    /// Directory with the checkout of the problem revision to work on.
    #[clap(short = 't', long = "task-dir", default_value = ".")]
    pub task_dir: PathBuf,

    /// Identifier of the problem; defaults to the name of the task directory.
    #[clap(long)]
    pub problem: Option<String>,

    /// Hash of the revision the task directory is a checkout of.
    #[clap(long, default_value = "workingcopy")]
    pub commit: String,

    /// Directory of the artifact store; defaults to the platform cache directory.
    #[clap(long)]
    pub store_dir: Option<PathBuf>,

    /// Number of workers consuming the job queue; defaults to the number of cores.
    #[clap(long)]
    pub workers: Option<usize>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate and validate all the test data of the revision.
    Generate,
    /// Run some solutions across some test cases and report the verdicts.
    Invoke {
        /// The solutions to run; all of them when empty.
        #[clap(long = "solution")]
        solutions: Vec<String>,
        /// The test cases to run on; all of them when empty.
        #[clap(long = "testcase")]
        testcases: Vec<String>,
    },
    /// Mark the artifacts of a target and of its dependents stale.
    Invalidate {
        /// The target, e.g. `problem`, `solution/sol.cpp`, `testcase/t1/input`.
        target: String,
    },
}

impl Opt {
    /// The store directory to use: the explicit one or the platform cache directory.
    pub fn store_dir(&self) -> Result<PathBuf, Error> {
        if let Some(dir) = &self.store_dir {
            return Ok(dir.clone());
        }
        let dirs = directories::ProjectDirs::from("", "", "taskprep");
        match dirs {
            Some(dirs) => Ok(dirs.cache_dir().to_path_buf()),
            None => bail!("Cannot resolve the platform cache directory, pass --store-dir"),
        }
    }

    /// The identity of the revision to work on.
    pub fn commit_id(&self) -> Result<CommitId, Error> {
        let problem = match &self.problem {
            Some(problem) => problem.clone(),
            None => match self.task_dir.canonicalize()?.file_name() {
                Some(name) => name.to_string_lossy().to_string(),
                None => bail!("Cannot derive the problem name, pass --problem"),
            },
        };
        Ok(CommitId::new(problem, self.commit.clone()))
    }
}

/// Parse a target spelled on the command line.
pub fn parse_target(commit: &CommitId, spec: &str) -> Result<TargetRef, Error> {
    let parts: Vec<&str> = spec.split('/').collect();
    match parts.as_slice() {
        ["problem"] => Ok(TargetRef::Problem {
            commit: commit.clone(),
        }),
        ["testcase", name, "input"] => Ok(TargetRef::TestCaseInput {
            commit: commit.clone(),
            testcase: name.to_string(),
        }),
        ["testcase", name, "output"] => Ok(TargetRef::TestCaseOutput {
            commit: commit.clone(),
            testcase: name.to_string(),
        }),
        ["validation", validator, testcase] => Ok(TargetRef::Validation {
            commit: commit.clone(),
            validator: validator.to_string(),
            testcase: testcase.to_string(),
        }),
        [kind, name] => {
            let kind = match *kind {
                "resources" => SourceKind::Resource,
                "inputgenerator" => SourceKind::InputGenerator,
                "validator" => SourceKind::Validator,
                "checker" => SourceKind::Checker,
                "grader" => SourceKind::Grader,
                "solution" => SourceKind::Solution,
                _ => bail!("Unknown target kind {:?}", kind),
            };
            Ok(TargetRef::Source {
                commit: commit.clone(),
                kind,
                name: name.to_string(),
            })
        }
        _ => bail!("Cannot parse the target {:?}", spec),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_target() {
        let commit = CommitId::new("p", "abc");
        assert_eq!(
            parse_target(&commit, "problem").unwrap(),
            TargetRef::Problem {
                commit: commit.clone()
            }
        );
        assert_eq!(
            parse_target(&commit, "solution/sol.cpp").unwrap(),
            TargetRef::Source {
                commit: commit.clone(),
                kind: SourceKind::Solution,
                name: "sol.cpp".into()
            }
        );
        assert_eq!(
            parse_target(&commit, "testcase/t1/input").unwrap(),
            TargetRef::TestCaseInput {
                commit: commit.clone(),
                testcase: "t1".into()
            }
        );
        assert!(parse_target(&commit, "nonsense").is_err());
    }
}
