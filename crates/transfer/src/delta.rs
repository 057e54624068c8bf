//! Manifest diffing.

use std::collections::BTreeSet;

use dirdelta_protocol::{FileManifest, FileRecord};

/// Outcome of comparing a remote manifest against a local one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    /// Remote records the local side must receive, in remote order.
    pub needed: Vec<FileRecord>,
    /// Remote paths that carry no hash and cannot be compared.
    pub unresolved: Vec<String>,
    /// Remote records already present locally with equal size and hash.
    pub unchanged: usize,
}

impl Delta {
    /// `true` when nothing must be transferred or reported.
    pub fn is_empty(&self) -> bool {
        self.needed.is_empty() && self.unresolved.is_empty()
    }

    pub fn needed_paths(&self) -> BTreeSet<&str> {
        self.needed
            .iter()
            .map(|r| r.relative_path.as_str())
            .collect()
    }

    /// Sum of the sizes of the needed records.
    pub fn needed_bytes(&self) -> u64 {
        self.needed.iter().map(|r| r.size).sum()
    }
}

/// Computes which `remote` records differ from `local`.
///
/// A remote record is needed when the local side lacks it, holds it
/// unhashed, or holds it with a different size or hash. Remote records
/// without a hash land in [`Delta::unresolved`].
///
/// For downloads `local` is the requester's manifest and `remote` the
/// host's; for uploads the sides are swapped.
pub fn resolve(local: &FileManifest, remote: &FileManifest) -> Delta {
    let mut delta = Delta::default();

    for record in remote {
        let Some(remote_hash) = record.hash else {
            delta.unresolved.push(record.relative_path.clone());
            continue;
        };

        let differs = match local.get(&record.relative_path) {
            None => true,
            Some(mine) => match mine.hash {
                None => true,
                Some(_) if mine.size != record.size => true,
                Some(local_hash) => local_hash != remote_hash,
            },
        };

        if differs {
            delta.needed.push(record.clone());
        } else {
            delta.unchanged += 1;
        }
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn rec(path: &str, content: &[u8]) -> FileRecord {
        let size = content.len() as u64;
        FileRecord::new(path, size).hashed(size, hash_bytes(content))
    }

    fn host_manifest() -> FileManifest {
        vec![
            rec("a.txt", b"alpha"),
            rec("b.txt", b"bravo"),
            rec("c/d.txt", b"delta"),
        ]
        .into()
    }

    #[test]
    fn empty_local_needs_everything() {
        let delta = resolve(&FileManifest::new(), &host_manifest());
        let paths: Vec<&str> = delta.needed.iter().map(|r| r.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "c/d.txt"]);
        assert_eq!(delta.unchanged, 0);
        assert_eq!(delta.needed_bytes(), 15);
    }

    #[test]
    fn identical_manifests_resolve_empty() {
        let m = host_manifest();
        let delta = resolve(&m, &m);
        assert!(delta.is_empty());
        assert_eq!(delta.unchanged, 3);
    }

    #[test]
    fn changed_content_same_size_is_needed() {
        let local: FileManifest = vec![rec("a.txt", b"alpha"), rec("b.txt", b"BRAVO")].into();
        let delta = resolve(&local, &host_manifest());
        assert_eq!(
            delta.needed_paths(),
            BTreeSet::from(["b.txt", "c/d.txt"])
        );
        assert_eq!(delta.unchanged, 1);
    }

    #[test]
    fn size_mismatch_is_needed_even_with_equal_hash() {
        let remote = host_manifest();
        let a = remote.get("a.txt").unwrap();
        let mut bogus = a.clone();
        bogus.size += 1;
        let local: FileManifest = vec![bogus].into();

        let delta = resolve(&local, &remote);
        assert!(delta.needed_paths().contains("a.txt"));
    }

    #[test]
    fn unhashed_local_record_is_needed() {
        let local: FileManifest = vec![FileRecord::new("a.txt", 5)].into();
        let delta = resolve(&local, &host_manifest());
        assert!(delta.needed_paths().contains("a.txt"));
    }

    #[test]
    fn unhashed_remote_record_is_unresolved() {
        let mut remote = host_manifest();
        remote.insert(FileRecord::new("raw.bin", 10));

        let delta = resolve(&remote, &remote);
        assert!(delta.needed.is_empty());
        assert_eq!(delta.unresolved, vec!["raw.bin".to_string()]);
        assert!(!delta.is_empty());
    }

    #[test]
    fn extra_local_files_are_ignored() {
        let mut local = host_manifest();
        local.insert(rec("only-local.txt", b"x"));
        assert!(resolve(&local, &host_manifest()).is_empty());
    }

    #[test]
    fn swapped_sides_for_uploads() {
        let host = host_manifest();
        let requester: FileManifest = vec![rec("a.txt", b"alpha"), rec("new.txt", b"n")].into();
        let upload = resolve(&host, &requester);
        assert_eq!(upload.needed_paths(), BTreeSet::from(["new.txt"]));
    }
}
