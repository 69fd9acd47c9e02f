//! Local archive handling for uploads.
//!
//! Batches are packed into a temporary TAR or ZIP file that is removed as
//! soon as the batch finishes.

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use xnatctl_transfer::{TransferError, validate_relative_path};
use zip::write::SimpleFileOptions;

/// Container format of an uploaded batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Tar,
    Zip,
}

impl ArchiveFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Tar => "application/x-tar",
            Self::Zip => "application/zip",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zip => "zip",
        }
    }
}

/// A batch archive on disk, deleted on drop.
pub struct BatchArchive {
    path: PathBuf,
    size: u64,
    _dir: TempDir,
}

impl BatchArchive {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for BatchArchive {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to remove batch archive");
        }
    }
}

/// Packs `files` into a fresh temporary archive.
///
/// Entry names are paths relative to `base_dir` with `/` separators. Files
/// outside `base_dir` keep their whole path without the root. Two files
/// mapping to the same entry name are a `Validation` error.
pub fn build_archive(
    files: &[PathBuf],
    base_dir: &Path,
    format: ArchiveFormat,
    name: &str,
) -> Result<BatchArchive, TransferError> {
    if files.is_empty() {
        return Err(TransferError::Validation("cannot archive an empty batch".into()));
    }

    let dir = tempfile::Builder::new().prefix("xnatctl-upload-").tempdir()?;
    let path = dir.path().join(format!("{name}.{}", format.extension()));
    let entries: Vec<(PathBuf, String)> = files
        .iter()
        .map(|f| (f.clone(), entry_name(f, base_dir)))
        .collect();
    let mut seen = HashSet::new();
    if let Some((source, name)) = entries.iter().find(|(_, name)| !seen.insert(name.as_str())) {
        return Err(TransferError::Validation(format!(
            "{} collides with another file as archive entry {name}",
            source.display()
        )));
    }

    match format {
        ArchiveFormat::Tar => write_tar(&path, &entries)?,
        ArchiveFormat::Zip => write_zip(&path, &entries)?,
    }

    let size = std::fs::metadata(&path)?.len();
    tracing::debug!(archive = %path.display(), files = files.len(), size, "batch archive built");
    Ok(BatchArchive {
        path,
        size,
        _dir: dir,
    })
}

fn entry_name(file: &Path, base_dir: &Path) -> String {
    let rel = match file.strip_prefix(base_dir) {
        Ok(rel) if !rel.as_os_str().is_empty() => rel,
        _ => file,
    };
    let parts: Vec<_> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        "file".into()
    } else {
        parts.join("/")
    }
}

fn write_tar(path: &Path, entries: &[(PathBuf, String)]) -> Result<(), TransferError> {
    let mut builder = tar::Builder::new(File::create(path)?);
    for (source, name) in entries {
        builder.append_path_with_name(source, name)?;
    }
    builder.into_inner()?;
    Ok(())
}

fn write_zip(path: &Path, entries: &[(PathBuf, String)]) -> Result<(), TransferError> {
    let mut writer = zip::ZipWriter::new(File::create(path)?);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    for (source, name) in entries {
        let mut input = File::open(source)?;
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| TransferError::Archive(format!("cannot add {name}: {e}")))?;
        io::copy(&mut input, &mut writer)?;
    }

    writer
        .finish()
        .map_err(|e| TransferError::Archive(format!("cannot finish {}: {e}", path.display())))?;
    Ok(())
}

/// Unpacks a ZIP upload source into `dest`, skipping directories and
/// entries that would escape it. Returns the extracted file paths.
pub fn unpack_zip_source(zip_path: &Path, dest: &Path) -> Result<Vec<PathBuf>, TransferError> {
    let mut archive = zip::ZipArchive::new(File::open(zip_path)?)
        .map_err(|e| TransferError::Archive(format!("cannot open {}: {e}", zip_path.display())))?;
    let mut extracted = Vec::new();

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| TransferError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if validate_relative_path(&name).is_err() {
            tracing::warn!(entry = %name, "skipping unsafe zip entry");
            continue;
        }

        let target = dest.join(&name);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        extracted.push(target);
    }

    Ok(extracted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn sample_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::create_dir_all(dir.join("series")).unwrap();
        let a = dir.join("a.dcm");
        let b = dir.join("series").join("b.dcm");
        std::fs::write(&a, b"AAAA").unwrap();
        std::fs::write(&b, b"BBBB").unwrap();
        vec![a, b]
    }

    #[test]
    fn tar_archive_uses_relative_names() {
        let src = tempfile::TempDir::new().unwrap();
        let files = sample_files(src.path());

        let archive = build_archive(&files, src.path(), ArchiveFormat::Tar, "batch-1").unwrap();
        assert!(archive.path().ends_with("batch-1.tar"));
        assert!(archive.size() > 0);

        let mut tar = tar::Archive::new(File::open(archive.path()).unwrap());
        let mut names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.dcm", "series/b.dcm"]);
    }

    #[test]
    fn zip_archive_round_trips_content() {
        let src = tempfile::TempDir::new().unwrap();
        let files = sample_files(src.path());

        let archive = build_archive(&files, src.path(), ArchiveFormat::Zip, "batch-2").unwrap();
        let mut zip = zip::ZipArchive::new(File::open(archive.path()).unwrap()).unwrap();
        let mut content = String::new();
        zip.by_name("series/b.dcm")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "BBBB");
    }

    #[test]
    fn archive_is_removed_on_drop() {
        let src = tempfile::TempDir::new().unwrap();
        let files = sample_files(src.path());

        let archive = build_archive(&files, src.path(), ArchiveFormat::Tar, "x").unwrap();
        let path = archive.path().to_path_buf();
        assert!(path.exists());
        drop(archive);
        assert!(!path.exists());
    }

    #[test]
    fn outside_files_keep_their_directories() {
        let work = tempfile::TempDir::new().unwrap();
        let base = work.path().join("src");
        std::fs::create_dir_all(&base).unwrap();
        let mut files = Vec::new();
        for dir in ["a", "b"] {
            std::fs::create_dir_all(work.path().join(dir)).unwrap();
            let file = work.path().join(dir).join("1.dcm");
            std::fs::write(&file, dir).unwrap();
            files.push(file);
        }

        let archive = build_archive(&files, &base, ArchiveFormat::Tar, "x").unwrap();
        let mut tar = tar::Archive::new(File::open(archive.path()).unwrap());
        let names: Vec<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(names[0].ends_with("a/1.dcm"), "{names:?}");
        assert!(names[1].ends_with("b/1.dcm"), "{names:?}");
    }

    #[test]
    fn colliding_entry_names_are_rejected() {
        let base = tempfile::TempDir::new().unwrap();
        let files = vec![base.path().join("y/1.dcm"), PathBuf::from("y/1.dcm")];

        let err = build_archive(&files, base.path(), ArchiveFormat::Zip, "x").err().unwrap();
        assert!(matches!(err, TransferError::Validation(_)), "{err}");
    }

    #[test]
    fn empty_batch_is_rejected() {
        let src = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            build_archive(&[], src.path(), ArchiveFormat::Tar, "x"),
            Err(TransferError::Validation(_))
        ));
    }

    #[test]
    fn unpack_skips_traversal() {
        let work = tempfile::TempDir::new().unwrap();
        let zip_path = work.path().join("in.zip");
        {
            let mut w = zip::ZipWriter::new(File::create(&zip_path).unwrap());
            let opts = SimpleFileOptions::default();
            w.add_directory("d/", opts).unwrap();
            w.start_file("d/one.dcm", opts).unwrap();
            w.write_all(b"1").unwrap();
            w.start_file("../evil.dcm", opts).unwrap();
            w.write_all(b"x").unwrap();
            w.finish().unwrap();
        }

        let dest = work.path().join("out");
        std::fs::create_dir_all(&dest).unwrap();
        let files = unpack_zip_source(&zip_path, &dest).unwrap();

        assert_eq!(files, vec![dest.join("d/one.dcm")]);
        assert!(!work.path().join("evil.dcm").exists());
    }
}
