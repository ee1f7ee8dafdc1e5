//! Per-commit artifact descriptors.
//!
//! Every artifact is exclusively owned by the `(commit, logical-name)` pair that produced it. The
//! [`CommitStore`] keeps, for each `(problem, commit)`, a directory of small JSON descriptors
//! binding logical names to [`FileKey`](crate::FileKey)s in the content-addressed store:
//!
//! ```text
//! <root>/<problem_id>/<c0>/<c1>/<c2>/<rest_of_commit_hash>/
//!     info.json
//!     resources/<name>.desc
//!     validator/<name>.desc
//!     checker/<name>.desc
//!     inputgenerator/<name>.desc
//!     grader/<name>.desc
//!     solution/<name>.desc
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::FileKey;

/// The characters that cannot appear verbatim in a stored file name.
const RESERVED_CHARS: &str = "/\\|?*<>:+[]\"\u{0000}%";

/// The name of the descriptor with the commit metadata.
const INFO_FILE: &str = "info.json";

/// Identity of a problem snapshot: the problem and the commit hash of the revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommitId {
    /// Identifier of the problem.
    pub problem: String,
    /// Hash of the commit, lowercase hex.
    pub commit: String,
}

impl CommitId {
    /// Make a new `CommitId`.
    pub fn new<P: Into<String>, C: Into<String>>(problem: P, commit: C) -> CommitId {
        CommitId {
            problem: problem.into(),
            commit: commit.into(),
        }
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.problem, self.commit)
    }
}

/// The kind of a named source inside a commit. Each kind maps to a directory of descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceKind {
    /// A shared resource file, included in every compilation.
    Resource,
    /// A test-case input generator.
    InputGenerator,
    /// An input validator.
    Validator,
    /// An output checker.
    Checker,
    /// A grader, compiled together with the solutions.
    Grader,
    /// A solution, including the model solution.
    Solution,
}

impl SourceKind {
    /// The name of the descriptor directory for this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            SourceKind::Resource => "resources",
            SourceKind::InputGenerator => "inputgenerator",
            SourceKind::Validator => "validator",
            SourceKind::Checker => "checker",
            SourceKind::Grader => "grader",
            SourceKind::Solution => "solution",
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A descriptor binding the logical name of an artifact to its content key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// The logical name of the artifact, unquoted.
    pub name: String,
    /// The key of the artifact content in the file store.
    pub file: FileKey,
}

/// The per-`(problem, commit)` half of the artifact storage.
#[derive(Debug, Clone)]
pub struct CommitStore {
    /// Base directory under which all the commit trees live.
    root: PathBuf,
}

impl CommitStore {
    /// Make a new `CommitStore` rooted at the given directory.
    pub fn new<P: Into<PathBuf>>(root: P) -> CommitStore {
        CommitStore { root: root.into() }
    }

    /// The directory of a commit: `<root>/<problem>/<c0>/<c1>/<c2>/<rest>`.
    pub fn commit_dir(&self, id: &CommitId) -> PathBuf {
        let hash = &id.commit;
        let mut chars = hash.chars();
        let c0 = chars.next().map(String::from).unwrap_or_default();
        let c1 = chars.next().map(String::from).unwrap_or_default();
        let c2 = chars.next().map(String::from).unwrap_or_default();
        let rest: String = chars.collect();
        self.root
            .join(quote_name(&id.problem))
            .join(c0)
            .join(c1)
            .join(c2)
            .join(rest)
    }

    /// Write the `info.json` of a commit.
    pub fn write_info<T: Serialize>(&self, id: &CommitId, info: &T) -> Result<(), Error> {
        let dir = self.commit_dir(id);
        let serialized = serde_json::to_vec_pretty(info).context("Failed to serialize info")?;
        atomic_write(&dir.join(INFO_FILE), &serialized)
    }

    /// Read back the `info.json` of a commit, if present.
    pub fn read_info<T: DeserializeOwned>(&self, id: &CommitId) -> Result<Option<T>, Error> {
        let path = self.commit_dir(id).join(INFO_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let info = serde_json::from_slice(&content)
            .with_context(|| format!("Broken info descriptor at {}", path.display()))?;
        Ok(Some(info))
    }

    /// Path of the descriptor of a named artifact.
    fn descriptor_path(&self, id: &CommitId, kind: SourceKind, name: &str) -> PathBuf {
        self.commit_dir(id)
            .join(kind.dir_name())
            .join(format!("{}.desc", quote_name(name)))
    }

    /// Write the descriptor of an artifact. The descriptor is published atomically.
    pub fn write_descriptor(
        &self,
        id: &CommitId,
        kind: SourceKind,
        desc: &ArtifactDescriptor,
    ) -> Result<(), Error> {
        let path = self.descriptor_path(id, kind, &desc.name);
        let serialized =
            serde_json::to_vec_pretty(desc).context("Failed to serialize descriptor")?;
        atomic_write(&path, &serialized)
    }

    /// Read the descriptor of an artifact, `None` if it was never written or has been removed.
    pub fn read_descriptor(
        &self,
        id: &CommitId,
        kind: SourceKind,
        name: &str,
    ) -> Result<Option<ArtifactDescriptor>, Error> {
        let path = self.descriptor_path(id, kind, name);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let desc = serde_json::from_slice(&content)
            .with_context(|| format!("Broken descriptor at {}", path.display()))?;
        Ok(Some(desc))
    }

    /// Remove the descriptor of an artifact. Removing a missing descriptor is a no-op, making the
    /// invalidation of an artifact idempotent.
    pub fn remove_descriptor(
        &self,
        id: &CommitId,
        kind: SourceKind,
        name: &str,
    ) -> Result<(), Error> {
        let path = self.descriptor_path(id, kind, name);
        if path.exists() {
            std::fs::remove_file(&path)
                .with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        Ok(())
    }

    /// The logical names of all the descriptors of a kind inside a commit.
    pub fn list_descriptors(&self, id: &CommitId, kind: SourceKind) -> Result<Vec<String>, Error> {
        let dir = self.commit_dir(id).join(kind.dir_name());
        if !dir.is_dir() {
            return Ok(vec![]);
        }
        let mut names = vec![];
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let entry = entry?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(stem) = file_name.strip_suffix(".desc") {
                names.push(unquote_name(stem)?);
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Write a file atomically: the content lands in a temporary file in the same directory, which is
/// then renamed over the destination.
fn atomic_write(path: &Path, content: &[u8]) -> Result<(), Error> {
    let dir = path.parent().expect("Invalid descriptor path");
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Cannot create directory at {}", dir.display()))?;
    let tmp = tempfile::NamedTempFile::new_in(dir)
        .context("Failed to create temporary descriptor file")?;
    std::fs::write(tmp.path(), content).context("Failed to write descriptor")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to publish {}", path.display()))?;
    Ok(())
}

/// Percent-encode the reserved characters of a logical name, byte-wise.
pub fn quote_name(name: &str) -> String {
    let mut quoted = String::with_capacity(name.len());
    for c in name.chars() {
        if RESERVED_CHARS.contains(c) {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).as_bytes() {
                quoted.push_str(&format!("%{:02x}", byte));
            }
        } else {
            quoted.push(c);
        }
    }
    quoted
}

/// Decode a percent-encoded logical name.
pub fn unquote_name(name: &str) -> Result<String, Error> {
    let mut bytes = Vec::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() != 2 {
                bail!("Truncated escape in name {:?}", name);
            }
            let byte = u8::from_str_radix(&hex, 16)
                .with_context(|| format!("Invalid escape %{} in name {:?}", hex, name))?;
            bytes.push(byte);
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    }
    String::from_utf8(bytes).with_context(|| format!("Name {:?} is not valid UTF-8", name))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    fn commit_id() -> CommitId {
        CommitId::new("aplusb", "0123456789abcdef")
    }

    #[test]
    fn test_quote_name_plain() {
        assert_eq!(quote_name("solution.cpp"), "solution.cpp");
    }

    #[test]
    fn test_quote_name_reserved() {
        assert_eq!(quote_name("a/b"), "a%2fb");
        assert_eq!(quote_name("a%b"), "a%25b");
        assert_eq!(quote_name("a\"b?"), "a%22b%3f");
    }

    #[test]
    fn test_quote_name_roundtrip() {
        for name in ["plain.cpp", "we/ird|na:me*", "%%", "unicode è fine"] {
            assert_eq!(unquote_name(&quote_name(name)).unwrap(), name);
        }
    }

    #[test]
    fn test_unquote_name_invalid() {
        assert!(unquote_name("a%2").is_err());
        assert!(unquote_name("a%zz").is_err());
    }

    #[test]
    fn test_commit_dir_layout() {
        let store = CommitStore::new("/cache");
        let dir = store.commit_dir(&commit_id());
        assert_eq!(
            dir,
            PathBuf::from("/cache/aplusb/0/1/2/3456789abcdef")
        );
    }

    #[test]
    fn test_info_roundtrip() {
        let cwd = TempDir::new().unwrap();
        let store = CommitStore::new(cwd.path());
        let id = commit_id();
        assert_eq!(store.read_info::<String>(&id).unwrap(), None);
        store.write_info(&id, &"some info".to_string()).unwrap();
        assert_eq!(
            store.read_info::<String>(&id).unwrap(),
            Some("some info".to_string())
        );
    }

    #[test]
    fn test_descriptor_roundtrip() {
        let cwd = TempDir::new().unwrap();
        let store = CommitStore::new(cwd.path());
        let id = commit_id();
        let desc = ArtifactDescriptor {
            name: "sol.cpp".into(),
            file: crate::FileKey::from_content(b"binary"),
        };
        store
            .write_descriptor(&id, SourceKind::Solution, &desc)
            .unwrap();
        let back = store
            .read_descriptor(&id, SourceKind::Solution, "sol.cpp")
            .unwrap();
        assert_eq!(back, Some(desc));
        assert_eq!(
            store.list_descriptors(&id, SourceKind::Solution).unwrap(),
            vec!["sol.cpp".to_string()]
        );
    }

    #[test]
    fn test_remove_descriptor_idempotent() {
        let cwd = TempDir::new().unwrap();
        let store = CommitStore::new(cwd.path());
        let id = commit_id();
        let desc = ArtifactDescriptor {
            name: "gen.cpp".into(),
            file: crate::FileKey::from_content(b"bin"),
        };
        store
            .write_descriptor(&id, SourceKind::InputGenerator, &desc)
            .unwrap();
        store
            .remove_descriptor(&id, SourceKind::InputGenerator, "gen.cpp")
            .unwrap();
        store
            .remove_descriptor(&id, SourceKind::InputGenerator, "gen.cpp")
            .unwrap();
        assert_eq!(
            store
                .read_descriptor(&id, SourceKind::InputGenerator, "gen.cpp")
                .unwrap(),
            None
        );
    }
}
