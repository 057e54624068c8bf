//! Directory enumeration into manifests.
//!
//! Recursively walks a directory and produces unhashed records with
//! relative paths normalized to forward slashes.

use std::path::Path;

use dirdelta_protocol::{FileManifest, FileRecord};
use tracing::debug;

use crate::TransferError;

/// Scans `root` recursively and returns a manifest of its regular files.
///
/// Paths are relative to `root`, use `/` as separator and are sorted so
/// two scans of the same tree yield the same manifest.
pub fn scan_directory(root: &Path) -> Result<FileManifest, TransferError> {
    let metadata = match std::fs::metadata(root) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::PathNotFound(root.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_dir() {
        return Err(TransferError::InvalidRequest(format!(
            "not a directory: {}",
            root.display()
        )));
    }

    let mut records = Vec::new();
    walk_dir(root, root, &mut records)?;
    records.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    debug!(root = %root.display(), files = records.len(), "directory scanned");
    Ok(records.into())
}

fn walk_dir(
    root: &Path,
    current: &Path,
    records: &mut Vec<FileRecord>,
) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            walk_dir(root, &path, records)?;
        } else if metadata.is_file() {
            let rel_path = path.strip_prefix(root).map_err(std::io::Error::other)?;
            let rel_str = rel_path.to_string_lossy().replace('\\', "/");
            records.push(FileRecord::new(rel_str, metadata.len()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Files of the sample tree, by relative path.
    const SAMPLE: &[(&str, &[u8])] = &[
        ("assets/icons/app.png", b"\x89PNG fake image"),
        ("assets/readme.txt", b"read me first"),
        ("empty.log", b""),
        ("notes.md", b"# mirror notes"),
    ];

    fn sample_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        for (path, content) in SAMPLE {
            let full = dir.path().join(path);
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(full, content).unwrap();
        }
        // Directories without files leave no trace in the manifest.
        fs::create_dir_all(dir.path().join("cache/empty")).unwrap();
        dir
    }

    #[test]
    fn scan_lists_files_sorted_by_path() {
        let dir = sample_tree();
        let manifest = scan_directory(dir.path()).unwrap();

        let paths: Vec<&str> = manifest.paths().collect();
        let expected: Vec<&str> = SAMPLE.iter().map(|(path, _)| *path).collect();
        assert_eq!(paths, expected);

        let total: usize = SAMPLE.iter().map(|(_, content)| content.len()).sum();
        assert_eq!(manifest.total_size(), total as u64);
        assert_eq!(manifest.get("empty.log").unwrap().size, 0);
        assert!(manifest.iter().all(|r| r.hash.is_none()));
    }

    #[test]
    fn scan_is_deterministic() {
        let dir = sample_tree();
        assert_eq!(
            scan_directory(dir.path()).unwrap(),
            scan_directory(dir.path()).unwrap()
        );
    }

    #[test]
    fn scan_empty_dir() {
        let dir = TempDir::new().unwrap();
        let manifest = scan_directory(dir.path()).unwrap();
        assert!(manifest.is_empty());
        assert_eq!(manifest.total_size(), 0);
    }

    #[test]
    fn scan_nonexistent_dir() {
        let result = scan_directory(Path::new("/nonexistent/path/that/does/not/exist"));
        assert!(matches!(result, Err(TransferError::PathNotFound(_))));
    }

    #[test]
    fn scan_file_instead_of_dir() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();
        assert!(matches!(
            scan_directory(&file),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn scan_reports_sizes_of_large_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("blob.bin"), vec![7u8; 70_000]).unwrap();

        let manifest = scan_directory(dir.path()).unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("blob.bin").unwrap().size, 70_000);
    }
}
