//! Comparison of extracted files with the digests XNAT stores.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};
use xnatctl_session::{DEFAULT_RESULT_KEY, SessionClient, extract_results};
use xnatctl_transfer::{TransferError, validate_relative_path, verify_file};

/// One file in the server catalog of a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogFile {
    pub name: String,
    pub uri: String,
    /// Resource label.
    pub collection: String,
    pub digest: Option<String>,
}

impl CatalogFile {
    /// Location of this file below the session directory.
    pub fn local_path(&self, scan_id: &str) -> Option<PathBuf> {
        let rel = match self.uri.split_once("/files/") {
            Some((_, rest)) if !rest.is_empty() => rest,
            _ => self.name.as_str(),
        };
        validate_relative_path(rel).ok()?;
        let mut path = PathBuf::from("scans");
        path.push(scan_id);
        path.push("resources");
        path.push(&self.collection);
        path.push("files");
        path.push(rel);
        Some(path)
    }
}

/// Fetches the file catalog of one scan.
pub async fn scan_catalog(
    client: &SessionClient,
    session_id: &str,
    scan_id: &str,
) -> Result<Vec<CatalogFile>, TransferError> {
    let value = client
        .get_json(&format!("/data/experiments/{session_id}/scans/{scan_id}/files"), &[])
        .await?;
    Ok(extract_results(&value, DEFAULT_RESULT_KEY)
        .iter()
        .filter_map(catalog_row)
        .collect())
}

fn catalog_row(row: &Value) -> Option<CatalogFile> {
    let field = |key: &str| row.get(key).and_then(Value::as_str).map(str::to_string);
    Some(CatalogFile {
        name: field("Name")?,
        uri: field("URI").unwrap_or_default(),
        collection: field("collection")?,
        digest: field("digest").filter(|d| !d.is_empty()),
    })
}

/// Checks every file of `scan_id` below `session_dir`, or only those of
/// `resource` when given.
///
/// Returns one error per missing or mismatching file. Files without a
/// server digest are skipped.
pub async fn verify_scan(
    client: &SessionClient,
    session_id: &str,
    scan_id: &str,
    resource: Option<&str>,
    session_dir: &Path,
) -> Result<Vec<TransferError>, TransferError> {
    let mut catalog = scan_catalog(client, session_id, scan_id).await?;
    if let Some(resource) = resource {
        catalog.retain(|f| f.collection == resource);
    }
    let session_dir = session_dir.to_path_buf();
    let scan = scan_id.to_string();

    let problems = tokio::task::spawn_blocking(move || {
        let mut problems = Vec::new();
        for file in &catalog {
            let Some(expected) = &file.digest else {
                debug!(file = %file.name, "no digest on server");
                continue;
            };
            let Some(rel) = file.local_path(&scan) else {
                warn!(uri = %file.uri, "unsafe catalog path");
                problems.push(TransferError::Validation(format!("unsafe catalog path {}", file.uri)));
                continue;
            };
            let path = session_dir.join(rel);
            if !path.is_file() {
                problems.push(TransferError::Verification {
                    path: path.display().to_string(),
                    expected: expected.clone(),
                    actual: "missing".to_string(),
                });
                continue;
            }
            if let Err(e) = verify_file(&path, expected) {
                problems.push(e);
            }
        }
        problems
    })
    .await?;

    Ok(problems)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn local_path_uses_uri_tail() {
        let file = catalog_row(&json!({
            "Name": "a.dcm",
            "URI": "/data/experiments/E1/scans/2/resources/11/files/sub/a.dcm",
            "collection": "DICOM",
            "digest": "5eb63bbbe01eeed093cb22bb8f5acdc3"
        }))
        .unwrap();
        assert_eq!(
            file.local_path("2"),
            Some(PathBuf::from("scans/2/resources/DICOM/files/sub/a.dcm"))
        );
    }

    #[test]
    fn local_path_falls_back_to_name() {
        let file = CatalogFile {
            name: "b.dcm".into(),
            uri: String::new(),
            collection: "DICOM".into(),
            digest: None,
        };
        assert_eq!(
            file.local_path("9"),
            Some(PathBuf::from("scans/9/resources/DICOM/files/b.dcm"))
        );
    }

    #[test]
    fn rejects_escaping_uri() {
        let file = CatalogFile {
            name: "x".into(),
            uri: "/data/files/../../../etc/passwd".into(),
            collection: "DICOM".into(),
            digest: None,
        };
        assert_eq!(file.local_path("1"), None);
    }

    #[test]
    fn rows_without_collection_are_skipped() {
        assert!(catalog_row(&json!({"Name": "a"})).is_none());
        let row = catalog_row(&json!({"Name": "a", "collection": "DICOM", "digest": ""})).unwrap();
        assert_eq!(row.digest, None);
    }
}
