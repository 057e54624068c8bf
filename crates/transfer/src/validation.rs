use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates that a relative file path does not escape its base directory.
///
/// Rejects:
/// - Empty paths
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent directory traversal (`..`)
/// - Windows prefix components (`C:`, `\\server`)
pub fn validate_relative_path(file_path: &str) -> Result<(), TransferError> {
    if file_path.is_empty() {
        return Err(TransferError::InvalidRequest("empty path".into()));
    }

    let path = Path::new(file_path);
    if path.is_absolute() {
        return Err(TransferError::PathEscapesRoot(format!(
            "absolute path not allowed: {file_path}"
        )));
    }

    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::PathEscapesRoot(format!(
                    "parent directory traversal not allowed: {file_path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::PathEscapesRoot(format!(
                    "absolute path not allowed: {file_path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Normalizes a subdirectory lexically into `/`-separated form.
///
/// `.` segments and empty segments are dropped and `..` pops the previous
/// segment. Both separators are accepted. The empty string means the root
/// itself. A path that is absolute, or that climbs above the root, fails
/// with [`TransferError::PathEscapesRoot`].
pub fn normalize_subdir(subdir: &str) -> Result<String, TransferError> {
    let escapes = || TransferError::PathEscapesRoot(subdir.to_string());

    if subdir.starts_with('/') || subdir.starts_with('\\') || has_drive_prefix(subdir) {
        return Err(escapes());
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in subdir.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(escapes());
                }
            }
            other => parts.push(other),
        }
    }
    Ok(parts.join("/"))
}

/// Joins a normalized `subdir` onto `root`.
pub fn resolve_under_root(root: &Path, subdir: &str) -> Result<PathBuf, TransferError> {
    let normalized = normalize_subdir(subdir)?;
    if normalized.is_empty() {
        return Ok(root.to_path_buf());
    }
    Ok(root.join(normalized))
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(matches!(
            validate_relative_path(""),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn rejects_parent_dir_traversal() {
        assert!(matches!(
            validate_relative_path("../../../etc/passwd"),
            Err(TransferError::PathEscapesRoot(_))
        ));
        assert!(validate_relative_path("sub/../../../escape").is_err());
        assert!(validate_relative_path("..").is_err());
    }

    #[test]
    fn rejects_absolute_unix_path() {
        assert!(validate_relative_path("/tmp/malicious").is_err());
    }

    #[test]
    fn accepts_relative_paths() {
        assert!(validate_relative_path("game.exe").is_ok());
        assert!(validate_relative_path("sub/dir/file.txt").is_ok());
        assert!(validate_relative_path(".config/settings.json").is_ok());
        assert!(validate_relative_path("./game.exe").is_ok());
    }

    #[test]
    fn normalize_collapses_segments() {
        assert_eq!(normalize_subdir("").unwrap(), "");
        assert_eq!(normalize_subdir(".").unwrap(), "");
        assert_eq!(normalize_subdir("assets/").unwrap(), "assets");
        assert_eq!(normalize_subdir("a//b/./c").unwrap(), "a/b/c");
        assert_eq!(normalize_subdir("a\\b").unwrap(), "a/b");
        assert_eq!(normalize_subdir("a/b/../c").unwrap(), "a/c");
        assert_eq!(normalize_subdir("a/..").unwrap(), "");
    }

    #[test]
    fn normalize_rejects_escape() {
        for bad in ["..", "../x", "a/../../x", "/etc", "\\share", "C:/Windows"] {
            assert!(
                matches!(normalize_subdir(bad), Err(TransferError::PathEscapesRoot(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn resolve_joins_under_root() {
        let root = Path::new("/srv/app");
        assert_eq!(resolve_under_root(root, "").unwrap(), root);
        assert_eq!(
            resolve_under_root(root, "levels/./one").unwrap(),
            root.join("levels/one")
        );
        assert!(resolve_under_root(root, "../other").is_err());
    }
}
