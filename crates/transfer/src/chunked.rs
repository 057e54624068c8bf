use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use dirdelta_protocol::ContentHash;
use tracing::debug;

use crate::TransferError;
use crate::hash::hash_file;

// ---------------------------------------------------------------------------
// IncrementalRead
// ---------------------------------------------------------------------------

/// Source of file bytes at arbitrary offsets.
///
/// Installing an implementation lets the sender split files into chunks
/// instead of sending each one whole. Implementations may serve content
/// from somewhere other than the plain filesystem (archives, caches).
pub trait IncrementalRead: Send + Sync {
    /// Reads up to `buf.len()` bytes of `path` starting at `offset`.
    ///
    /// Returns the number of bytes read; 0 means end of file.
    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<usize>;
}

/// Reads straight from the filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSystemReader;

impl IncrementalRead for FileSystemReader {
    fn read(&self, path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Reads exactly `len` bytes of `path` at `offset`.
///
/// A source that ends early yields an `UnexpectedEof` I/O error, which
/// happens when a file shrinks after it was hashed.
pub fn read_chunk(
    reader: &dyn IncrementalRead,
    path: &Path,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>, TransferError> {
    let len = usize::try_from(len)
        .map_err(|_| TransferError::InvalidRequest(format!("chunk of {len} bytes too large")))?;
    let mut buf = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = reader.read(path, offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{} ended at {} bytes, wanted {}",
                    path.display(),
                    offset + filled as u64,
                    offset + len as u64
                ),
            )
            .into());
        }
        filled += n;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// StagingFile
// ---------------------------------------------------------------------------

/// Receives chunks for one file under a temporary name.
///
/// The file only appears at its final path after [`commit`](Self::commit)
/// has verified its content hash.
#[derive(Debug)]
pub struct StagingFile {
    file: File,
    staging_path: PathBuf,
    final_path: PathBuf,
    written: u64,
}

impl StagingFile {
    /// Creates (or truncates) `<final_path><suffix>`, creating parent
    /// directories as needed.
    pub fn create(final_path: &Path, suffix: &str) -> Result<Self, TransferError> {
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut name = OsString::from(final_path.as_os_str());
        name.push(suffix);
        let staging_path = PathBuf::from(name);

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&staging_path)?;
        Ok(Self {
            file,
            staging_path,
            final_path: final_path.to_path_buf(),
            written: 0,
        })
    }

    /// Writes `data` at `offset`.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.written = self.written.max(offset + data.len() as u64);
        Ok(())
    }

    /// Highest byte offset written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Verifies the staged content against `expected` and moves it into place.
    ///
    /// On a mismatch the staging file is removed and
    /// [`TransferError::ChecksumMismatch`] is returned.
    pub fn commit(mut self, expected: &ContentHash) -> Result<PathBuf, TransferError> {
        if let Err(e) = self.verify(expected) {
            let _ = self.discard();
            return Err(e);
        }
        self.persist()
    }

    /// Flushes the staged content and checks it against `expected`,
    /// leaving the staging file in place either way.
    pub fn verify(&mut self, expected: &ContentHash) -> Result<(), TransferError> {
        self.file.flush()?;
        self.file.sync_all()?;
        let (_, actual) = hash_file(&self.staging_path)?;
        if actual != *expected {
            return Err(TransferError::ChecksumMismatch(format!(
                "{}: expected {expected}, got {actual}",
                self.final_path.display()
            )));
        }
        Ok(())
    }

    /// Moves the staged content to the final path without checking it.
    pub fn persist(self) -> Result<PathBuf, TransferError> {
        let Self {
            file,
            staging_path,
            final_path,
            ..
        } = self;
        drop(file);
        std::fs::rename(&staging_path, &final_path)?;
        debug!(path = %final_path.display(), "staged file committed");
        Ok(final_path)
    }

    /// Removes the staging file without touching the final path.
    pub fn discard(self) -> Result<(), TransferError> {
        let Self { file, staging_path, .. } = self;
        drop(file);
        match std::fs::remove_file(&staging_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_test_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn filesystem_reader_reads_at_offset() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "test.bin", b"AABBCCDDEE");

        assert_eq!(read_chunk(&FileSystemReader, &path, 0, 4).unwrap(), b"AABB");
        assert_eq!(read_chunk(&FileSystemReader, &path, 4, 4).unwrap(), b"CCDD");
        assert_eq!(read_chunk(&FileSystemReader, &path, 8, 2).unwrap(), b"EE");
    }

    #[test]
    fn short_source_is_eof_error() {
        let dir = TempDir::new().unwrap();
        let path = create_test_file(dir.path(), "short.bin", b"abc");
        match read_chunk(&FileSystemReader, &path, 0, 10) {
            Err(TransferError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn read_chunk_retries_partial_reads() {
        struct Trickle(AtomicUsize);
        impl IncrementalRead for Trickle {
            fn read(&self, _path: &Path, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
                self.0.fetch_add(1, Ordering::SeqCst);
                buf[0] = offset as u8;
                Ok(1)
            }
        }

        let reader = Trickle(AtomicUsize::new(0));
        let data = read_chunk(&reader, Path::new("virtual"), 10, 3).unwrap();
        assert_eq!(data, vec![10, 11, 12]);
        assert_eq!(reader.0.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn staging_writes_then_commits() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("sub/dir/out.bin");

        let mut staging = StagingFile::create(&target, ".part").unwrap();
        assert!(staging.staging_path().ends_with("out.bin.part"));
        staging.write_at(0, b"Hello").unwrap();
        staging.write_at(5, b" World").unwrap();
        assert_eq!(staging.written(), 11);
        assert!(!target.exists());

        let committed = staging.commit(&hash_bytes(b"Hello World")).unwrap();
        assert_eq!(committed, target);
        assert_eq!(std::fs::read(&target).unwrap(), b"Hello World");
        assert!(!dir.path().join("sub/dir/out.bin.part").exists());
    }

    #[test]
    fn commit_replaces_existing_file() {
        let dir = TempDir::new().unwrap();
        let target = create_test_file(dir.path(), "a.txt", b"old content");

        let mut staging = StagingFile::create(&target, ".part").unwrap();
        staging.write_at(0, b"new").unwrap();
        staging.commit(&hash_bytes(b"new")).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new");
    }

    #[test]
    fn checksum_mismatch_removes_staging() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("bad.bin");

        let mut staging = StagingFile::create(&target, ".part").unwrap();
        staging.write_at(0, b"tampered").unwrap();
        let staging_path = staging.staging_path().to_path_buf();

        let result = staging.commit(&hash_bytes(b"original"));
        assert!(matches!(result, Err(TransferError::ChecksumMismatch(_))));
        assert!(!staging_path.exists());
        assert!(!target.exists());
    }

    #[test]
    fn verify_keeps_staging_until_persisted() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("two-step.bin");

        let mut staging = StagingFile::create(&target, ".part").unwrap();
        staging.write_at(0, b"payload").unwrap();
        assert!(matches!(
            staging.verify(&hash_bytes(b"other")),
            Err(TransferError::ChecksumMismatch(_))
        ));
        assert!(staging.staging_path().exists());

        staging.verify(&hash_bytes(b"payload")).unwrap();
        assert!(!target.exists());
        staging.persist().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn discard_leaves_final_path_alone() {
        let dir = TempDir::new().unwrap();
        let target = create_test_file(dir.path(), "keep.txt", b"keep");

        let mut staging = StagingFile::create(&target, ".tmp").unwrap();
        staging.write_at(0, b"partial").unwrap();
        staging.discard().unwrap();

        assert!(!dir.path().join("keep.txt.tmp").exists());
        assert_eq!(std::fs::read(&target).unwrap(), b"keep");
    }
}
