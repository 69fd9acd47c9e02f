//! Extraction of server archives into the session directory layout.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;
use xnatctl_transfer::{TransferError, validate_relative_path};

/// Maps archive entry names onto the local layout.
///
/// Server archives name entries
/// `{session}/scans/{id}-{type}/resources/{label}/files/{rest}` for scans and
/// `{session}/resources/{label}/files/{rest}` for session resources.
#[derive(Debug, Clone, Default)]
pub struct EntryMapper {
    /// Known scan IDs, used to strip the `-{type}` suffix.
    scan_ids: Vec<String>,
    /// Scan the archive belongs to, when fetched per scan.
    fixed_scan: Option<String>,
    /// Resource the archive belongs to, when fetched per resource.
    fixed_resource: Option<String>,
}

impl EntryMapper {
    pub fn for_scans(scan_ids: Vec<String>) -> Self {
        Self {
            scan_ids,
            ..Self::default()
        }
    }

    pub fn for_scan(scan_id: impl Into<String>) -> Self {
        let scan_id = scan_id.into();
        Self {
            scan_ids: vec![scan_id.clone()],
            fixed_scan: Some(scan_id),
            fixed_resource: None,
        }
    }

    pub fn for_resource(label: impl Into<String>) -> Self {
        Self {
            fixed_resource: Some(label.into()),
            ..Self::default()
        }
    }

    /// Path relative to the session directory, or `None` for entries that
    /// would escape it.
    pub fn map(&self, entry: &str) -> Option<PathBuf> {
        let parts: Vec<&str> = entry
            .split(['/', '\\'])
            .filter(|p| !p.is_empty() && *p != ".")
            .collect();
        if parts.is_empty() || parts.contains(&"..") {
            return None;
        }

        let mapped = if let Some(pos) = parts.iter().position(|p| *p == "scans")
            && pos + 1 < parts.len()
            && self.fixed_resource.is_none()
        {
            let scan = self.scan_id(parts[pos + 1]);
            let (label, rest) = split_resource(&parts[pos + 2..])?;
            join(&["scans", scan.as_str(), "resources", label, "files"], rest)
        } else if let Some(pos) = parts.iter().position(|p| *p == "resources") {
            let (label, rest) = split_resource(&parts[pos..])?;
            join(&["resources", label, "files"], rest)
        } else if let Some(label) = &self.fixed_resource {
            join(&["resources", label.as_str(), "files"], &parts[parts.len() - 1..])
        } else {
            join(&[], &parts)
        };

        let rel = mapped.to_string_lossy().into_owned();
        validate_relative_path(&rel).ok().map(|_| mapped)
    }

    fn scan_id(&self, dir: &str) -> String {
        if let Some(fixed) = &self.fixed_scan {
            return fixed.clone();
        }
        self.scan_ids
            .iter()
            .filter(|id| dir == id.as_str() || dir.starts_with(&format!("{id}-")))
            .max_by_key(|id| id.len())
            .cloned()
            .unwrap_or_else(|| dir.split('-').next().unwrap_or(dir).to_string())
    }
}

/// Splits `[resources]/{label}/[files]/{rest..}` into label and rest.
fn split_resource<'a>(parts: &'a [&'a str]) -> Option<(&'a str, &'a [&'a str])> {
    let parts = match parts.first() {
        Some(&"resources") => &parts[1..],
        _ => parts,
    };
    let (label, rest) = parts.split_first()?;
    let rest = match rest.first() {
        Some(&"files") => &rest[1..],
        _ => rest,
    };
    if rest.is_empty() {
        return None;
    }
    Some((*label, rest))
}

fn join(prefix: &[&str], rest: &[&str]) -> PathBuf {
    prefix.iter().chain(rest.iter()).collect()
}

/// Extracts a ZIP archive into `session_dir`, overwriting existing files.
///
/// Returns the number of files written. Unsafe entries are skipped.
pub fn extract_archive(zip_path: &Path, session_dir: &Path, mapper: &EntryMapper) -> Result<usize, TransferError> {
    let file = File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| TransferError::Archive(format!("cannot open {}: {e}", zip_path.display())))?;

    let mut written = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| TransferError::Archive(format!("{}: {e}", zip_path.display())))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let Some(rel) = mapper.map(&name) else {
            warn!(entry = %name, archive = %zip_path.display(), "skipping unsafe archive entry");
            continue;
        };

        let target = session_dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        written += 1;
    }
    Ok(written)
}
