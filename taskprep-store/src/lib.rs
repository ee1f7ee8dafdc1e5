//! Artifact storage for the preparation pipeline.
//!
//! The storage is split in two halves. The [`FileStore`] is a content-addressed folder where every
//! byte string produced by a job ends up, indexed by the blake3 hash of its content. Files are
//! published atomically (write-to-temp-then-rename) and marked read-only, so readers never observe
//! a partial write and values never mutate once written.
//!
//! The [`CommitStore`](commit::CommitStore) is the per-`(problem, commit)` view: a small tree of
//! JSON descriptors binding the logical name of an artifact (`solution/sol.cpp`,
//! `inputgenerator/gen.cpp`, ...) to its [`FileKey`] in the content-addressed half.
//!
//! # Example
//!
//! ```
//! use taskprep_store::FileStore;
//!
//! # use anyhow::Error;
//! # use tempfile::TempDir;
//! # fn main() -> Result<(), Error> {
//! # let tmp = TempDir::new().unwrap();
//! let store = FileStore::new(tmp.path().join("store"))?;
//! let handle = store.store_bytes(b"hello world")?;
//! assert!(store.get(handle.key()).is_some());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

#[macro_use]
extern crate log;

use std::fmt::Formatter;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use read_file_iterator::ReadFileIterator;

pub mod commit;
mod read_file_iterator;
mod state_file;

pub use commit::{ArtifactDescriptor, CommitId, CommitStore, SourceKind};
pub use state_file::StateFile;

/// The name of the lock of the file store.
const STORE_LOCK_FILE: &str = "exclusive.lock";

/// Length in bytes of a blake3 hash.
const HASH_LEN: usize = blake3::OUT_LEN;

/// The content-addressed half of the artifact storage.
///
/// The directory is guarded by a file lock, making the access exclusive even between processes.
/// Since the store is keyed by content, storing the same bytes twice is a no-op.
#[derive(Debug)]
pub struct FileStore {
    /// Base directory of the store.
    base_path: PathBuf,
    /// Handle of the lock file. Keeping it alive keeps the lock.
    _lock: fslock::LockFile,
}

/// Key of a file inside the [`FileStore`]: the blake3 hash of its content.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileKey {
    /// The hash of the content of the file.
    hash: [u8; HASH_LEN],
}

/// Handle to a file stored inside the [`FileStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHandle {
    /// The key of the file.
    key: FileKey,
    /// Path of the file on disk.
    path: PathBuf,
}

impl FileStore {
    /// Open (or create) a `FileStore` rooted at the given directory, waiting for the exclusive
    /// lock if another instance is using it.
    pub fn new<P: Into<PathBuf>>(base_path: P) -> Result<FileStore, Error> {
        let base_path = base_path.into();
        debug!("Opening file store at {}", base_path.display());
        std::fs::create_dir_all(&base_path).with_context(|| {
            format!(
                "Failed to create storage directory at {}",
                base_path.display()
            )
        })?;
        let lock_path = base_path.join(STORE_LOCK_FILE);
        let mut lock = fslock::LockFile::open(lock_path.as_os_str())
            .with_context(|| format!("Failed to create lock file at {}", lock_path.display()))?;
        if !lock.try_lock().context("Failed to probe storage lock")? {
            warn!("Store locked... waiting");
            lock.lock()
                .context("Failed to obtain exclusive lock on storage")?;
        }
        Ok(FileStore {
            base_path,
            _lock: lock,
        })
    }

    /// Consume an iterator of chunks writing them to disk, unless a file with the same key is
    /// already present. Returns the handle of the stored file.
    pub fn store<I>(&self, key: &FileKey, content: I) -> Result<FileHandle, Error>
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        let path = self.key_to_path(key);
        trace!("Storing {:?}", path);
        if path.exists() {
            trace!("File {:?} already exists", path);
            content.into_iter().last(); // consume all the iterator
        } else {
            let dir = path.parent().expect("Invalid store path");
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Cannot create directory at {}", dir.display()))?;
            let tmpdir = tempfile::TempDir::new_in(dir)
                .context("Failed to create temporary directory for storing the file")?;
            let tmpfile_path = tmpdir.path().join("file");
            let mut tmpfile =
                File::create(&tmpfile_path).context("Failed to create temporary file")?;
            for chunk in content {
                tmpfile
                    .write_all(&chunk)
                    .context("Failed to store file content")?;
            }
            // moving a file is atomic, so concurrent stores of the same key are safe
            std::fs::rename(&tmpfile_path, &path).with_context(|| {
                format!(
                    "Failed to rename {} -> {}",
                    tmpfile_path.display(),
                    path.display()
                )
            })?;
            FileStore::mark_readonly(&path).context("Failed to mark file as readonly")?;
        }
        Ok(FileHandle {
            key: *key,
            path,
        })
    }

    /// Hash and store a file from the local filesystem.
    pub fn store_file<P: AsRef<Path>>(&self, path: P) -> Result<FileHandle, Error> {
        let path = path.as_ref();
        let key = FileKey::from_file(path)?;
        let iter = ReadFileIterator::new(path)?;
        self.store(&key, iter)
    }

    /// Hash and store an in-memory byte string.
    pub fn store_bytes(&self, content: &[u8]) -> Result<FileHandle, Error> {
        let key = FileKey::from_content(content);
        self.store(&key, std::iter::once(content.to_vec()))
    }

    /// Returns the handle of the file with that key, or `None` if it's not in the store.
    pub fn get(&self, key: &FileKey) -> Option<FileHandle> {
        let path = self.key_to_path(key);
        if !path.exists() {
            return None;
        }
        Some(FileHandle { key: *key, path })
    }

    /// Path of the file with that key on disk.
    fn key_to_path(&self, key: &FileKey) -> PathBuf {
        self.base_path.join(key.suffix())
    }

    /// Mark a file as readonly.
    fn mark_readonly(path: &Path) -> Result<(), Error> {
        let mut perms = std::fs::metadata(path)
            .with_context(|| format!("Failed to get file metadata of {}", path.display()))?
            .permissions();
        perms.set_readonly(true);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("Failed to set permission of {}", path.display()))?;
        Ok(())
    }
}

impl FileKey {
    /// Get the suffix of the path of this `FileKey`. For example, if the key is `aabbccddeeff...`
    /// this method will return `aa/bb/aabbccddeeff...`.
    fn suffix(&self) -> PathBuf {
        let full = self.to_string();
        PathBuf::from(&full[0..2]).join(&full[2..4]).join(full)
    }

    /// Make a new `FileKey` from a file on disk. The file must exist and be readable.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<FileKey, Error> {
        let path = path.as_ref();
        if !path.exists() {
            bail!("Cannot read {}, maybe broken symlink?", path.display())
        }
        let mut hasher = blake3::Hasher::new();
        let file_reader = ReadFileIterator::new(path)
            .with_context(|| format!("Cannot make file iterator of {}", path.display()))?;
        for chunk in file_reader {
            hasher.update(&chunk);
        }
        Ok(FileKey {
            hash: *hasher.finalize().as_bytes(),
        })
    }

    /// Make a new `FileKey` from an in-memory byte string.
    pub fn from_content(content: &[u8]) -> FileKey {
        FileKey {
            hash: *blake3::hash(content).as_bytes(),
        }
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.hash {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut Formatter) -> Result<(), std::fmt::Error> {
        f.write_str(&self.to_string())
    }
}

impl Serialize for FileKey {
    fn serialize<S>(&self, serializer: S) -> Result<<S as Serializer>::Ok, <S as Serializer>::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FileKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, <D as Deserializer<'de>>::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;
        let data = String::deserialize(deserializer)?;
        if data.len() != HASH_LEN * 2 {
            return Err(D::Error::custom("invalid hash length"));
        }
        let mut hash = [0u8; HASH_LEN];
        for (i, chunk) in data.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| D::Error::custom("invalid hash"))?;
            hash[i] = u8::from_str_radix(hex, 16).map_err(|_| D::Error::custom("invalid hash"))?;
        }
        Ok(FileKey { hash })
    }
}

impl FileHandle {
    /// The path of the file pointed by this handle.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The key of the file pointed by this handle.
    pub fn key(&self) -> &FileKey {
        &self.key
    }

    /// Read the whole content of the file in memory.
    pub fn read_contents(&self) -> Result<Vec<u8>, Error> {
        std::fs::read(&self.path)
            .with_context(|| format!("Failed to read artifact at {}", self.path.display()))
    }
}

impl std::fmt::Display for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.path.display(), f)
    }
}
