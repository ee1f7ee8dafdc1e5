use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use const_format::concatcp;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Magic string at the start of every state file. Bumping the version invalidates the snapshots
/// persisted with an incompatible layout.
const MAGIC: &[u8] = concatcp!("taskprep-state", "\u{0}", "1").as_bytes();

/// An atomically rewritten bincode snapshot on disk.
///
/// Used for the mutable side of the pipeline state (commit state, the job table, invocation
/// results): the whole value is serialized and republished with a write-to-temp-then-rename on
/// every save, so readers never observe a partial write. A missing or incompatible file loads as
/// the default value.
#[derive(Debug, Clone)]
pub struct StateFile {
    /// Path of the snapshot on disk.
    path: PathBuf,
}

impl StateFile {
    /// Make a new `StateFile` stored at the given path.
    pub fn new<P: Into<PathBuf>>(path: P) -> StateFile {
        StateFile { path: path.into() }
    }

    /// The path of the snapshot on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted value, falling back to the default when the file is missing. A corrupted
    /// or incompatible snapshot resets to the default.
    pub fn load<T: DeserializeOwned + Default>(&self) -> Result<T, Error> {
        if !self.path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read(&self.path)
            .with_context(|| format!("Failed to read state file {}", self.path.display()))?;
        if content.len() < MAGIC.len() || &content[..MAGIC.len()] != MAGIC {
            error!("State file {} is incompatible, resetting", self.path.display());
            return Ok(T::default());
        }
        match bincode::deserialize(&content[MAGIC.len()..]) {
            Ok(value) => Ok(value),
            Err(e) => {
                error!(
                    "State file {} is broken ({}), resetting",
                    self.path.display(),
                    e
                );
                Ok(T::default())
            }
        }
    }

    /// Persist a value, atomically replacing the previous snapshot.
    pub fn save<T: Serialize>(&self, value: &T) -> Result<(), Error> {
        let dir = self.path.parent().expect("Invalid state file path");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Cannot create directory at {}", dir.display()))?;
        let mut content = MAGIC.to_vec();
        content
            .extend(bincode::serialize(value).context("Failed to serialize state")?);
        let tmp = tempfile::NamedTempFile::new_in(dir)
            .context("Failed to create temporary state file")?;
        std::fs::write(tmp.path(), &content).context("Failed to write state")?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to publish {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde::Deserialize;
    use tempfile::TempDir;

    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct TestState {
        counter: u32,
        names: Vec<String>,
    }

    #[test]
    fn test_load_missing() {
        let cwd = TempDir::new().unwrap();
        let file = StateFile::new(cwd.path().join("state.bin"));
        let state: TestState = file.load().unwrap();
        assert_eq!(state, TestState::default());
    }

    #[test]
    fn test_save_and_load() {
        let cwd = TempDir::new().unwrap();
        let file = StateFile::new(cwd.path().join("state.bin"));
        let state = TestState {
            counter: 42,
            names: vec!["a".into(), "b".into()],
        };
        file.save(&state).unwrap();
        let back: TestState = file.load().unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_load_corrupted_resets() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("state.bin");
        std::fs::write(&path, b"not a state file").unwrap();
        let file = StateFile::new(&path);
        let state: TestState = file.load().unwrap();
        assert_eq!(state, TestState::default());
    }
}
