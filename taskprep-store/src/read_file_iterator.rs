use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{Context, Error};

/// Buffer size when reading a file.
const READ_FILE_BUFFER_SIZE: usize = 8 * 1024;
/// Type of the reading buffer.
type ReadFileBuffer = [u8; READ_FILE_BUFFER_SIZE];

/// Iterator over the content of a file, yielding chunks of at most
/// `READ_FILE_BUFFER_SIZE` bytes. Used for hashing and storing files without
/// loading them in memory.
pub struct ReadFileIterator {
    /// Reader used to read the file.
    buf_reader: BufReader<File>,
    /// Current read buffer.
    buf: ReadFileBuffer,
}

impl ReadFileIterator {
    /// Make a new iterator reading the file at that path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<ReadFileIterator, Error> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        Ok(ReadFileIterator {
            buf_reader: BufReader::new(file),
            buf: [0; READ_FILE_BUFFER_SIZE],
        })
    }
}

impl Iterator for ReadFileIterator {
    type Item = Vec<u8>;
    fn next(&mut self) -> Option<Self::Item> {
        match self.buf_reader.read(&mut self.buf) {
            Ok(0) => None,
            Ok(n) => Some(self.buf[0..n].to_vec()),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_read_file_iterator_404() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        assert!(ReadFileIterator::new(path).is_err());
    }

    #[test]
    fn test_read_file_iterator_empty_file() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        std::fs::write(&path, []).unwrap();
        let mut iter = ReadFileIterator::new(&path).unwrap();
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_read_file_iterator_small_file() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        std::fs::write(&path, [1, 2, 3, 4]).unwrap();
        let mut iter = ReadFileIterator::new(&path).unwrap();
        assert_eq!(iter.next(), Some(vec![1, 2, 3, 4]));
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_read_file_iterator_multiple_chunks() {
        let cwd = TempDir::new().unwrap();
        let path = cwd.path().join("file.txt");
        let content = vec![123; READ_FILE_BUFFER_SIZE + 1];
        std::fs::write(&path, &content).unwrap();
        let mut iter = ReadFileIterator::new(&path).unwrap();
        assert_eq!(
            iter.next(),
            Some(content[0..READ_FILE_BUFFER_SIZE].to_owned())
        );
        assert_eq!(iter.next(), Some(vec![123]));
        assert_eq!(iter.next(), None);
    }
}
