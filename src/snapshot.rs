//! Read-only access to the problem tree at a given commit.
//!
//! The version-control layer is an external collaborator: the pipeline only consumes this
//! interface. Paths are UTF-8 and `/`-separated; when a logical name is mapped to the backing
//! storage its reserved characters are percent-encoded byte-wise, as in the artifact store.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Context, Error};

use taskprep_store::commit::quote_name;
use taskprep_store::CommitId;

/// Timestamps of a file inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    /// When the file was created.
    pub created_at: SystemTime,
    /// When the file was last modified.
    pub updated_at: SystemTime,
}

/// A read-only view of the problem tree at one commit.
pub trait Snapshot: Send + Sync {
    /// Whether a file exists at the given path.
    fn exists(&self, path: &str) -> bool;

    /// The content of the file at the given path.
    fn blob_at(&self, path: &str) -> Result<Vec<u8>, Error>;

    /// The paths under the given directory, optionally descending recursively.
    fn list(&self, path: &str, recursive: bool) -> Result<BTreeSet<String>, Error>;

    /// The timestamps of the file at the given path.
    fn stat(&self, path: &str) -> Result<FileStat, Error>;
}

/// Something able to open the snapshot of a commit.
pub trait SnapshotProvider: Send + Sync {
    /// Open the snapshot of the given commit.
    fn open(&self, commit: &CommitId) -> Result<Arc<dyn Snapshot>, Error>;
}

/// A snapshot backed by a plain directory on disk.
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    root: PathBuf,
}

impl DirSnapshot {
    /// Make a new `DirSnapshot` rooted at the given directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> DirSnapshot {
        DirSnapshot { root: root.into() }
    }

    /// Map a logical path to the backing storage, percent-encoding each component.
    fn path_of(&self, path: &str) -> PathBuf {
        let mut result = self.root.clone();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            result.push(quote_name(component));
        }
        result
    }

    fn list_dir(
        &self,
        prefix: &str,
        dir: &PathBuf,
        recursive: bool,
        out: &mut BTreeSet<String>,
    ) -> Result<(), Error> {
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let entry = entry?;
            let name =
                taskprep_store::commit::unquote_name(&entry.file_name().to_string_lossy())?;
            let logical = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            if entry.file_type()?.is_dir() {
                if recursive {
                    self.list_dir(&logical, &entry.path(), recursive, out)?;
                }
            } else {
                out.insert(logical);
            }
        }
        Ok(())
    }
}

impl Snapshot for DirSnapshot {
    fn exists(&self, path: &str) -> bool {
        self.path_of(path).is_file()
    }

    fn blob_at(&self, path: &str) -> Result<Vec<u8>, Error> {
        let disk_path = self.path_of(path);
        if !disk_path.is_file() {
            bail!("No file at {} in the snapshot", path);
        }
        std::fs::read(&disk_path)
            .with_context(|| format!("Failed to read {} from the snapshot", path))
    }

    fn list(&self, path: &str, recursive: bool) -> Result<BTreeSet<String>, Error> {
        let dir = self.path_of(path);
        let mut out = BTreeSet::new();
        if dir.is_dir() {
            self.list_dir(path.trim_matches('/'), &dir, recursive, &mut out)?;
        }
        Ok(out)
    }

    fn stat(&self, path: &str) -> Result<FileStat, Error> {
        let disk_path = self.path_of(path);
        let metadata = std::fs::metadata(&disk_path)
            .with_context(|| format!("No file at {} in the snapshot", path))?;
        let updated_at = metadata.modified().context("Missing modification time")?;
        // not all the filesystems track the creation time
        let created_at = metadata.created().unwrap_or(updated_at);
        Ok(FileStat {
            created_at,
            updated_at,
        })
    }
}

/// A [`SnapshotProvider`] with an explicit directory per commit. Used by the command line tool and
/// the tests, where the commits are checked out on disk.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshotProvider {
    dirs: std::collections::HashMap<CommitId, PathBuf>,
}

impl DirSnapshotProvider {
    /// Make an empty provider.
    pub fn new() -> DirSnapshotProvider {
        Default::default()
    }

    /// Make a provider knowing a single commit.
    pub fn single<P: Into<PathBuf>>(commit: CommitId, dir: P) -> DirSnapshotProvider {
        let mut provider = DirSnapshotProvider::new();
        provider.add(commit, dir);
        provider
    }

    /// Register the checkout directory of a commit.
    pub fn add<P: Into<PathBuf>>(&mut self, commit: CommitId, dir: P) {
        self.dirs.insert(commit, dir.into());
    }
}

impl SnapshotProvider for DirSnapshotProvider {
    fn open(&self, commit: &CommitId) -> Result<Arc<dyn Snapshot>, Error> {
        let dir = self
            .dirs
            .get(commit)
            .with_context(|| format!("Unknown commit {}", commit))?;
        Ok(Arc::new(DirSnapshot::new(dir.clone())))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn make_tree() -> TempDir {
        let cwd = TempDir::new().unwrap();
        std::fs::create_dir_all(cwd.path().join("solution")).unwrap();
        std::fs::write(cwd.path().join("info.json"), "{}").unwrap();
        std::fs::write(cwd.path().join("solution/sol.cpp"), "int main() {}").unwrap();
        cwd
    }

    #[test]
    fn test_exists() {
        let cwd = make_tree();
        let snapshot = DirSnapshot::new(cwd.path());
        assert!(snapshot.exists("info.json"));
        assert!(snapshot.exists("solution/sol.cpp"));
        assert!(!snapshot.exists("solution/missing.cpp"));
        assert!(!snapshot.exists("solution"));
    }

    #[test]
    fn test_blob_at() {
        let cwd = make_tree();
        let snapshot = DirSnapshot::new(cwd.path());
        assert_eq!(snapshot.blob_at("info.json").unwrap(), b"{}");
        assert!(snapshot.blob_at("nope").is_err());
    }

    #[test]
    fn test_list() {
        let cwd = make_tree();
        let snapshot = DirSnapshot::new(cwd.path());
        let top = snapshot.list("", false).unwrap();
        assert!(top.contains("info.json"));
        assert!(!top.contains("solution/sol.cpp"));
        let all = snapshot.list("", true).unwrap();
        assert!(all.contains("solution/sol.cpp"));
        let solutions = snapshot.list("solution", true).unwrap();
        assert_eq!(solutions.into_iter().collect::<Vec<_>>(), vec![
            "solution/sol.cpp".to_string()
        ]);
    }

    #[test]
    fn test_stat() {
        let cwd = make_tree();
        let snapshot = DirSnapshot::new(cwd.path());
        let stat = snapshot.stat("info.json").unwrap();
        assert!(stat.updated_at <= SystemTime::now());
        assert!(snapshot.stat("nope").is_err());
    }

    #[test]
    fn test_provider() {
        let cwd = make_tree();
        let commit = CommitId::new("p", "abc");
        let provider = DirSnapshotProvider::single(commit.clone(), cwd.path());
        let snapshot = provider.open(&commit).unwrap();
        assert!(snapshot.exists("info.json"));
        assert!(provider.open(&CommitId::new("p", "def")).is_err());
    }
}
