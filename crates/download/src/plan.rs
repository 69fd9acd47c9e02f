//! Listing of scans and resources for a session.

use serde_json::Value;
use tracing::debug;
use xnatctl_session::{DEFAULT_RESULT_KEY, SessionClient, extract_results};
use xnatctl_transfer::TransferError;

use crate::types::{DownloadPlan, DownloadRequest, ResourceInfo, ScanInfo};

/// Builds the plan for `request`.
///
/// Resource sizes are only fetched when `with_sizes` is set since they
/// cost one request per scan.
pub async fn build_plan(
    client: &SessionClient,
    request: &DownloadRequest,
    with_sizes: bool,
) -> Result<DownloadPlan, TransferError> {
    if request.session_id.trim().is_empty() {
        return Err(TransferError::Validation("session id must not be empty".into()));
    }
    let session = &resolve_session(client, request).await?;

    let listing = client
        .get_json(&format!("/data/experiments/{session}/scans"), &[])
        .await?;
    let mut scans: Vec<ScanInfo> = extract_results(&listing, DEFAULT_RESULT_KEY)
        .iter()
        .filter_map(scan_from_row)
        .collect();

    if let Some(wanted) = &request.scans {
        let missing: Vec<&String> = wanted
            .iter()
            .filter(|id| !scans.iter().any(|s| &s.id == *id))
            .collect();
        if !missing.is_empty() {
            return Err(TransferError::Validation(format!(
                "scans not found in {session}: {}",
                missing.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
            )));
        }
        scans.retain(|s| wanted.contains(&s.id));
    }

    if with_sizes {
        for scan in &mut scans {
            let value = client
                .get_json(&format!("/data/experiments/{session}/scans/{}/resources", scan.id), &[])
                .await?;
            scan.resources = resources_from(&value);
            if let Some(wanted) = &request.resource {
                scan.resources.retain(|r| &r.label == wanted);
            }
        }
    }

    let resources = if request.include_resources {
        let value = client
            .get_json(&format!("/data/experiments/{session}/resources"), &[])
            .await?;
        resources_from(&value)
    } else {
        Vec::new()
    };

    Ok(DownloadPlan {
        session_id: session.clone(),
        session_dir: request.session_dir(),
        combined: request.workers <= 1,
        resource: request.resource.clone(),
        scans,
        resources,
    })
}

/// Maps a session label to its experiment ID through the project. Without
/// a project `session_id` is used as is.
async fn resolve_session(client: &SessionClient, request: &DownloadRequest) -> Result<String, TransferError> {
    let Some(project) = &request.project else {
        return Ok(request.session_id.clone());
    };
    let label = &request.session_id;
    let not_found = || TransferError::Validation(format!("session {label} not found in project {project}"));

    let value = match client
        .get_json(&format!("/data/projects/{project}/experiments/{label}"), &[])
        .await
    {
        Ok(value) => value,
        Err(e) if e.is_not_found() => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    let id = experiment_id(&value).ok_or_else(not_found)?;
    if &id != label {
        debug!(project = %project, label = %label, id = %id, "resolved session label");
    }
    Ok(id)
}

/// Experiment ID from either the `items` or the `ResultSet` form of an
/// experiment document.
fn experiment_id(value: &Value) -> Option<String> {
    value
        .pointer("/items/0/data_fields")
        .and_then(|fields| text(fields, "ID"))
        .or_else(|| extract_results(value, DEFAULT_RESULT_KEY).first().and_then(|row| text(row, "ID")))
}

fn scan_from_row(row: &Value) -> Option<ScanInfo> {
    let id = text(row, "ID")?;
    Some(ScanInfo {
        id,
        scan_type: text(row, "type"),
        resources: Vec::new(),
    })
}

fn resources_from(value: &Value) -> Vec<ResourceInfo> {
    extract_results(value, DEFAULT_RESULT_KEY)
        .iter()
        .filter_map(|row| {
            Some(ResourceInfo {
                label: text(row, "label")?,
                file_count: number(row, "file_count"),
                size_bytes: number(row, "file_size"),
            })
        })
        .collect()
}

/// XNAT returns most fields as strings, some as numbers.
fn text(row: &Value, key: &str) -> Option<String> {
    match row.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn number(row: &Value, key: &str) -> Option<u64> {
    match row.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_scan_rows() {
        let row = json!({"ID": "3", "type": "T1w", "quality": "usable"});
        let scan = scan_from_row(&row).unwrap();
        assert_eq!(scan.id, "3");
        assert_eq!(scan.scan_type.as_deref(), Some("T1w"));

        assert!(scan_from_row(&json!({"type": "x"})).is_none());
        assert_eq!(scan_from_row(&json!({"ID": 7})).unwrap().id, "7");
    }

    #[test]
    fn experiment_id_from_either_document_form() {
        let items = json!({"items": [{"data_fields": {"ID": "XNAT_E00042", "label": "MR_1"}}]});
        assert_eq!(experiment_id(&items).as_deref(), Some("XNAT_E00042"));

        let rows = json!({"ResultSet": {"Result": [{"ID": "XNAT_E00043"}]}});
        assert_eq!(experiment_id(&rows).as_deref(), Some("XNAT_E00043"));

        assert_eq!(experiment_id(&json!({"items": []})), None);
    }

    #[test]
    fn parses_resource_sizes_from_strings_or_numbers() {
        let value = json!({"ResultSet": {"Result": [
            {"label": "DICOM", "file_count": "12", "file_size": 2048},
            {"label": "SNAPSHOTS", "file_count": "", "file_size": null},
            {"xnat_abstractresource_id": "9"}
        ]}});
        let resources = resources_from(&value);
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[0].file_count, Some(12));
        assert_eq!(resources[0].size_bytes, Some(2048));
        assert_eq!(resources[1].file_count, None);
        assert_eq!(resources[1].size_bytes, None);
    }
}
