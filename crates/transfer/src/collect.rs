//! Input file discovery.
//!
//! Recursively walks a directory and returns a sorted list of files.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::TransferError;

/// Extensions of common imaging files.
pub const IMAGING_EXTENSIONS: &[&str] = &["dcm", "ima", "img", "dicom"];

/// Filters applied while collecting files.
#[derive(Debug, Clone)]
pub struct CollectOptions {
    /// Allowed extensions (lowercase, without dot). `None` keeps everything.
    pub extensions: Option<Vec<String>>,
    /// Keep files without an extension even when `extensions` is set.
    pub include_extensionless: bool,
    pub include_hidden: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            extensions: None,
            include_extensionless: true,
            include_hidden: false,
        }
    }
}

impl CollectOptions {
    /// Imaging files plus extensionless files (DICOM often has none).
    pub fn imaging() -> Self {
        Self {
            extensions: Some(IMAGING_EXTENSIONS.iter().map(|e| e.to_string()).collect()),
            ..Self::default()
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        if !self.include_hidden && name.starts_with('.') {
            return false;
        }
        let Some(allowed) = &self.extensions else {
            return true;
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => allowed.iter().any(|a| a.eq_ignore_ascii_case(ext)),
            None => self.include_extensionless,
        }
    }
}

/// Collects files under `root`, sorted by path.
///
/// `root` may itself be a file. Symlinks are followed; broken ones are
/// skipped.
pub fn collect_files(root: &Path, options: &CollectOptions) -> Result<Vec<PathBuf>, TransferError> {
    let metadata = std::fs::metadata(root)?;
    let mut files = Vec::new();

    if metadata.is_file() {
        if options.accepts(root) {
            files.push(root.to_path_buf());
        }
        return Ok(files);
    }

    walk_dir(root, options, &mut files)?;
    files.sort();
    Ok(files)
}

fn walk_dir(current: &Path, options: &CollectOptions, files: &mut Vec<PathBuf>) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(current)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'));
        if hidden && !options.include_hidden {
            continue;
        }

        // Follows symlinks.
        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable entry");
                continue;
            }
        };

        if metadata.is_dir() {
            walk_dir(&path, options, files)?;
        } else if metadata.is_file() && options.accepts(&path) {
            files.push(path);
        }
    }
    Ok(())
}
