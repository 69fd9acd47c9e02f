use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::TransferError;

/// Validates that a relative path (e.g. an archive entry) stays inside
/// its base directory.
///
/// Rejects empty paths, absolute paths, `..` and Windows prefixes.
pub fn validate_relative_path(path: &str) -> Result<(), TransferError> {
    if path.is_empty() {
        return Err(TransferError::Validation("empty path".into()));
    }

    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                return Err(TransferError::Validation(format!(
                    "parent directory traversal not allowed: {path}"
                )));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(TransferError::Validation(format!(
                    "absolute path not allowed: {path}"
                )));
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }

    Ok(())
}

/// Fails if two inputs resolve to the same file on disk.
///
/// Paths are canonicalized, so `a/../b.dcm` and `b.dcm` collide. Nothing
/// should be transferred when this fails.
pub fn ensure_unique_paths(paths: &[PathBuf]) -> Result<(), TransferError> {
    let mut seen: HashMap<PathBuf, &Path> = HashMap::with_capacity(paths.len());
    for path in paths {
        let canonical = std::fs::canonicalize(path).map_err(|e| {
            TransferError::Validation(format!("cannot resolve {}: {e}", path.display()))
        })?;
        if let Some(first) = seen.insert(canonical.clone(), path.as_path()) {
            return Err(TransferError::Validation(format!(
                "duplicate input {} and {} both resolve to {}",
                first.display(),
                path.display(),
                canonical.display()
            )));
        }
    }
    Ok(())
}
