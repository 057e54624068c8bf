//! Content hashing of manifests (SHA-256).

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

use dirdelta_protocol::{ContentHash, FileManifest, FileRecord};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::TransferError;

/// Read buffer used while hashing.
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Hashes an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
    ContentHash::from_raw(Sha256::digest(data).into())
}

/// Streams a file through SHA-256, returning the bytes read and the digest.
pub fn hash_file(path: &Path) -> std::io::Result<(u64, ContentHash)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, ContentHash::from_raw(hasher.finalize().into())))
}

/// A record that could not be hashed.
#[derive(Debug)]
pub struct HashFailure {
    pub record: FileRecord,
    pub error: TransferError,
}

/// Result of a batch hash run.
#[derive(Debug, Default)]
pub struct HashReport {
    /// Successfully hashed records, in input order.
    pub manifest: FileManifest,
    /// Records excluded from `manifest`, one entry per failed file.
    pub failures: Vec<HashFailure>,
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    size: u64,
    modified: SystemTime,
    hash: ContentHash,
}

/// Computes content hashes for manifests.
///
/// With caching enabled, a file whose size and modification time match a
/// previous run reuses the earlier hash instead of being re-read.
#[derive(Debug, Default)]
pub struct HashEngine {
    cache: Option<Mutex<HashMap<PathBuf, CacheEntry>>>,
}

impl HashEngine {
    /// Creates an engine that always reads file content.
    pub fn new() -> Self {
        Self { cache: None }
    }

    /// Creates an engine with the size + mtime cache enabled.
    pub fn with_cache() -> Self {
        Self {
            cache: Some(Mutex::new(HashMap::new())),
        }
    }

    pub fn is_caching(&self) -> bool {
        self.cache.is_some()
    }

    /// Number of cached entries (0 when caching is disabled).
    pub fn cached_entries(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| {
            c.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    /// Hashes every record of `manifest`, reading files below `base_dir`.
    ///
    /// Failures are collected per file; the batch always runs to the end.
    pub fn compute_hashes(&self, manifest: &FileManifest, base_dir: &Path) -> HashReport {
        let mut report = HashReport::default();
        for record in manifest {
            match self.hash_record(record, base_dir) {
                Ok(hashed) => {
                    report.manifest.insert(hashed);
                }
                Err(error) => {
                    warn!(path = %record.relative_path, %error, "hash failed");
                    report.failures.push(HashFailure {
                        record: record.clone(),
                        error,
                    });
                }
            }
        }
        debug!(
            base = %base_dir.display(),
            hashed = report.manifest.len(),
            failed = report.failures.len(),
            "hash batch finished"
        );
        report
    }

    /// Hashes a single record below `base_dir`.
    pub fn hash_record(
        &self,
        record: &FileRecord,
        base_dir: &Path,
    ) -> Result<FileRecord, TransferError> {
        let path = base_dir.join(&record.relative_path);
        let hash_err = |source: std::io::Error| TransferError::HashComputation {
            path: record.relative_path.clone(),
            source,
        };

        let Some(cache) = &self.cache else {
            let (size, hash) = hash_file(&path).map_err(hash_err)?;
            return Ok(record.hashed(size, hash));
        };

        let metadata = std::fs::metadata(&path).map_err(hash_err)?;
        let modified = metadata.modified().map_err(hash_err)?;
        let cached = cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
            .copied();
        if let Some(entry) = cached
            && entry.size == metadata.len()
            && entry.modified == modified
        {
            return Ok(record.hashed(entry.size, entry.hash));
        }

        let (size, hash) = hash_file(&path).map_err(hash_err)?;
        cache.lock().unwrap_or_else(PoisonError::into_inner).insert(
            path,
            CacheEntry {
                size,
                modified,
                hash,
            },
        );
        Ok(record.hashed(size, hash))
    }
}
