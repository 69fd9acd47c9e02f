use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::TransferError;

/// Hash algorithm of a server-side digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    /// Infers the algorithm from the hex length of a digest.
    pub fn from_digest(digest: &str) -> Option<Self> {
        let digest = digest.trim();
        if !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        match digest.len() {
            32 => Some(Self::Md5),
            64 => Some(Self::Sha256),
            _ => None,
        }
    }
}

fn hash_file<D: Digest>(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = D::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Hex MD5 of a file; XNAT reports file digests as MD5.
pub fn md5_file(path: &Path) -> Result<String, TransferError> {
    hash_file::<Md5>(path)
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String, TransferError> {
    hash_file::<Sha256>(path)
}

pub fn file_digest(path: &Path, algorithm: DigestAlgorithm) -> Result<String, TransferError> {
    match algorithm {
        DigestAlgorithm::Md5 => md5_file(path),
        DigestAlgorithm::Sha256 => sha256_file(path),
    }
}

/// Compares a file against an expected hex digest.
pub fn verify_file(path: &Path, expected: &str) -> Result<(), TransferError> {
    let algorithm = DigestAlgorithm::from_digest(expected).ok_or_else(|| {
        TransferError::Validation(format!("unrecognized digest {expected:?}"))
    })?;
    let actual = file_digest(path, algorithm)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(TransferError::Verification {
            path: path.display().to_string(),
            expected: expected.trim().to_string(),
            actual,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_known_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(md5_file(&path).unwrap(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(
            sha256_file(&path).unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn detects_algorithm_by_length() {
        assert_eq!(
            DigestAlgorithm::from_digest("5eb63bbbe01eeed093cb22bb8f5acdc3"),
            Some(DigestAlgorithm::Md5)
        );
        assert_eq!(
            DigestAlgorithm::from_digest(&"a".repeat(64)),
            Some(DigestAlgorithm::Sha256)
        );
        assert_eq!(DigestAlgorithm::from_digest("abc"), None);
        assert_eq!(DigestAlgorithm::from_digest(&"z".repeat(32)), None);
    }

    #[test]
    fn verify_match_and_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f.dcm");
        std::fs::write(&path, b"hello world").unwrap();

        verify_file(&path, "5EB63BBBE01EEED093CB22BB8F5ACDC3").unwrap();

        let err = verify_file(&path, "00000000000000000000000000000000").unwrap_err();
        match err {
            TransferError::Verification { actual, .. } => {
                assert_eq!(actual, "5eb63bbbe01eeed093cb22bb8f5acdc3")
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(matches!(
            verify_file(&path, "not-a-digest"),
            Err(TransferError::Validation(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = md5_file(Path::new("/nonexistent/file.dcm")).unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
