//! The shared context of the job handlers: stores, sandbox backend and the per-commit caches.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Error};

use taskprep_sandbox::{
    BoxIdAllocator, ResourceLimits, Sandbox, SandboxOutcome, SandboxRequest, SandboxRunner,
};
use taskprep_store::{CommitId, CommitStore, FileStore, StateFile};

use crate::invocation::InvocationDb;
use crate::manifest::ProblemManifest;
use crate::snapshot::{Snapshot, SnapshotProvider};
use crate::state::CommitStateDb;

/// Cpu time limit of the compilations, in seconds.
pub const COMPILE_TIME_LIMIT: f64 = 30.0;
/// Memory limit of the compilations, in KiB.
pub const COMPILE_MEMORY_LIMIT: u64 = 1024 * 1024;
/// Cpu time limit of the generators and validators, in seconds.
pub const GENERATOR_TIME_LIMIT: f64 = 10.0;
/// Memory limit of the generators and validators, in KiB.
pub const GENERATOR_MEMORY_LIMIT: u64 = 1024 * 1024;
/// Cpu time limit of the checkers, in seconds.
pub const CHECKER_TIME_LIMIT: f64 = 10.0;
/// Memory limit of the checkers, in KiB.
pub const CHECKER_MEMORY_LIMIT: u64 = 1024 * 1024;

/// Everything the job handlers share: the artifact stores, the sandbox backend and the lazily
/// opened per-commit state.
pub struct PipelineContext {
    /// The content-addressed artifact store.
    pub file_store: Arc<FileStore>,
    /// The per-commit descriptor store.
    pub commit_store: CommitStore,
    /// Where the sandbox directories are created.
    pub sandboxes_dir: PathBuf,
    /// The isolation backend.
    pub runner: Arc<dyn SandboxRunner>,
    /// The pool of sandbox box ids.
    pub box_ids: BoxIdAllocator,
    /// The version-control collaborator.
    pub snapshots: Box<dyn SnapshotProvider>,
    /// The invocations and their result matrices.
    pub invocations: InvocationDb,
    /// The opened commit states.
    states: Mutex<HashMap<CommitId, Arc<CommitStateDb>>>,
    /// The loaded manifests.
    manifests: Mutex<HashMap<CommitId, Arc<ProblemManifest>>>,
}

impl PipelineContext {
    /// Make a new context rooted at the given store directory.
    pub fn new(
        store_dir: &std::path::Path,
        snapshots: Box<dyn SnapshotProvider>,
        runner: Arc<dyn SandboxRunner>,
        num_boxes: u32,
    ) -> Result<PipelineContext, Error> {
        let file_store = Arc::new(FileStore::new(store_dir.join("files"))?);
        let commit_store = CommitStore::new(store_dir.join("commits"));
        let invocations =
            InvocationDb::open(StateFile::new(store_dir.join("invocations.bin")))?;
        Ok(PipelineContext {
            file_store,
            commit_store,
            sandboxes_dir: store_dir.join("sandboxes"),
            runner,
            box_ids: BoxIdAllocator::new(num_boxes),
            snapshots,
            invocations,
            states: Mutex::new(HashMap::new()),
            manifests: Mutex::new(HashMap::new()),
        })
    }

    /// The state of a commit, opened on first reference.
    pub fn state(&self, commit: &CommitId) -> Result<Arc<CommitStateDb>, Error> {
        let mut states = self.states.lock().unwrap();
        if let Some(state) = states.get(commit) {
            return Ok(state.clone());
        }
        let state = Arc::new(CommitStateDb::open(
            commit.clone(),
            self.commit_store.clone(),
        )?);
        states.insert(commit.clone(), state.clone());
        Ok(state)
    }

    /// The manifest of a commit, loaded from its snapshot on first reference and cached in the
    /// commit store.
    pub fn manifest(&self, commit: &CommitId) -> Result<Arc<ProblemManifest>, Error> {
        {
            let manifests = self.manifests.lock().unwrap();
            if let Some(manifest) = manifests.get(commit) {
                return Ok(manifest.clone());
            }
        }
        let snapshot = self.snapshot(commit)?;
        let manifest = Arc::new(
            ProblemManifest::load(snapshot.as_ref())
                .with_context(|| format!("Failed to load the manifest of {}", commit))?,
        );
        self.commit_store
            .write_info(commit, manifest.as_ref())
            .with_context(|| format!("Failed to cache the manifest of {}", commit))?;
        let mut manifests = self.manifests.lock().unwrap();
        manifests.insert(commit.clone(), manifest.clone());
        Ok(manifest)
    }

    /// The snapshot of a commit.
    pub fn snapshot(&self, commit: &CommitId) -> Result<Arc<dyn Snapshot>, Error> {
        self.snapshots.open(commit)
    }

    /// Run a sandbox request to completion with the configured backend.
    pub fn run_sandbox(&self, request: SandboxRequest) -> Result<SandboxOutcome, Error> {
        let lease = self.box_ids.allocate();
        let sandbox = Sandbox::new(&self.sandboxes_dir, request, lease)?;
        sandbox.run(self.runner.as_ref(), &self.file_store)
    }

    /// The limits used for the compilations.
    pub fn compile_limits(&self) -> ResourceLimits {
        ResourceLimits::new()
            .cpu_time(COMPILE_TIME_LIMIT)
            .memory(COMPILE_MEMORY_LIMIT)
    }

    /// The limits used for the generators and validators.
    pub fn generator_limits(&self) -> ResourceLimits {
        ResourceLimits::new()
            .cpu_time(GENERATOR_TIME_LIMIT)
            .memory(GENERATOR_MEMORY_LIMIT)
    }

    /// The limits used for the checkers.
    pub fn checker_limits(&self) -> ResourceLimits {
        ResourceLimits::new()
            .cpu_time(CHECKER_TIME_LIMIT)
            .memory(CHECKER_MEMORY_LIMIT)
    }

    /// The limits declared by the manifest for the solutions.
    pub fn solution_limits(&self, manifest: &ProblemManifest) -> ResourceLimits {
        ResourceLimits::new()
            .cpu_time(manifest.time_limit)
            .memory(manifest.memory_limit * 1024)
    }
}
