//! # taskprep
//!
//! A preparation pipeline for competitive programming problem packages: given an immutable commit
//! of a problem tree, it compiles the package sources, generates and validates the test inputs,
//! produces the reference outputs with the model solution, and grades every candidate solution
//! against every test case, producing reproducible verdicts.
//!
//! The six effectful operations (judge initialization, compilation, input generation, validation,
//! output generation, cell evaluation) form a DAG of jobs coordinated by the scheduler of
//! [`taskprep_queue`]: dependencies are discovered on demand, duplicate work is coalesced per
//! target, and jobs waiting for a prerequisite re-publish themselves with a bounded back-off.
//! Artifacts are cached by content identity, per `(problem, commit)`, in the stores of
//! [`taskprep_store`].

#![deny(missing_docs)]

#[macro_use]
extern crate log;

pub mod context;
pub mod invocation;
pub mod manifest;
pub mod pipeline;
pub mod snapshot;
pub mod state;
pub mod task_type;
pub mod verdict;

pub use context::PipelineContext;
pub use invocation::{CellResult, CellState, Invocation};
pub use manifest::ProblemManifest;
pub use pipeline::{Pipeline, PipelineConfig};
pub use snapshot::{DirSnapshot, DirSnapshotProvider, Snapshot, SnapshotProvider};
pub use verdict::{ExpectedVerdict, JudgeVerdict};
