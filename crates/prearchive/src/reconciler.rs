use tracing::{debug, info};
use xnatctl_session::{DEFAULT_RESULT_KEY, Params, RequestBody, SessionClient, SessionError, extract_results};

use crate::entry::{PrearchiveEntry, PrearchiveKey, PrearchiveStatus};
use crate::error::PrearchiveError;

/// Optional parameters of an archive request.
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    /// Target subject; the server derives one from DICOM otherwise.
    pub subject: Option<String>,
    /// Target session label.
    pub label: Option<String>,
    /// Replace an existing archived session.
    pub overwrite: bool,
}

impl ArchiveOptions {
    fn params(&self) -> Params {
        let mut params = vec![
            ("action".to_string(), "commit".to_string()),
            ("SOURCE".to_string(), "prearchive".to_string()),
        ];
        if let Some(subject) = &self.subject {
            params.push(("subject".into(), subject.clone()));
        }
        if let Some(label) = &self.label {
            params.push(("label".into(), label.clone()));
        }
        if self.overwrite {
            params.push(("overwrite".into(), "delete".into()));
        }
        params
    }
}

/// Drives prearchive entries through their lifecycle.
///
/// Transitions take the entry mutably and update it only after the server
/// confirmed the call; a failed call leaves the entry untouched.
pub struct PrearchiveReconciler {
    client: SessionClient,
}

impl PrearchiveReconciler {
    pub fn new(client: SessionClient) -> Self {
        Self { client }
    }

    /// Lists entries, optionally for one project.
    pub async fn list(&self, project: Option<&str>) -> Result<Vec<PrearchiveEntry>, PrearchiveError> {
        let path = match project {
            Some(project) => format!("/data/prearchive/projects/{project}"),
            None => "/data/prearchive".to_string(),
        };
        let value = self.client.get_json(&path, &[]).await?;
        Ok(extract_results(&value, DEFAULT_RESULT_KEY)
            .iter()
            .filter_map(PrearchiveEntry::from_row)
            .collect())
    }

    pub async fn get(&self, key: &PrearchiveKey) -> Result<PrearchiveEntry, PrearchiveError> {
        let value = match self.client.get_json(&key.path(), &[]).await {
            Ok(value) => value,
            Err(e) if e.is_not_found() => return Err(PrearchiveError::NotFound(key.clone())),
            Err(e) => return Err(e.into()),
        };
        extract_results(&value, DEFAULT_RESULT_KEY)
            .iter()
            .filter_map(PrearchiveEntry::from_row)
            .next()
            .ok_or_else(|| PrearchiveError::NotFound(key.clone()))
    }

    /// Re-reads `entry` from the server.
    ///
    /// Terminal entries no longer exist under their key and are rejected
    /// without a request.
    pub async fn refresh(&self, entry: &mut PrearchiveEntry) -> Result<(), PrearchiveError> {
        require(entry, "refresh", |s| !s.is_terminal())?;
        *entry = self.get(&entry.key).await?;
        Ok(())
    }

    /// Commits a ready entry into the archive. Returns the server response,
    /// usually the URI of the archived session.
    pub async fn archive(
        &self,
        entry: &mut PrearchiveEntry,
        options: &ArchiveOptions,
    ) -> Result<String, PrearchiveError> {
        require(entry, "archive", |s| *s == PrearchiveStatus::Ready)?;

        info!(entry = %entry.key, subject = ?options.subject, label = ?options.label, "archiving");
        let response = self
            .client
            .post(&entry.key.path(), &options.params(), RequestBody::Empty)
            .await?;
        let body = response.text().await.map_err(SessionError::from)?;

        entry.status = PrearchiveStatus::Archived;
        Ok(body.trim().to_string())
    }

    /// Removes a ready or receiving entry. Irreversible.
    pub async fn delete(&self, entry: &mut PrearchiveEntry) -> Result<(), PrearchiveError> {
        require(entry, "delete", |s| {
            matches!(s, PrearchiveStatus::Ready | PrearchiveStatus::Receiving)
        })?;

        info!(entry = %entry.key, "deleting");
        self.client.delete(&entry.key.path(), &[]).await?;
        entry.status = PrearchiveStatus::Deleted;
        Ok(())
    }

    /// Moves a ready entry into another project's prearchive. The entry is
    /// not archived.
    pub async fn move_to(&self, entry: &mut PrearchiveEntry, target_project: &str) -> Result<(), PrearchiveError> {
        require(entry, "move", |s| *s == PrearchiveStatus::Ready)?;

        info!(entry = %entry.key, target = target_project, "moving");
        let params = vec![
            ("action".to_string(), "move".to_string()),
            ("newProject".to_string(), target_project.to_string()),
        ];
        self.client
            .post(&entry.key.path(), &params, RequestBody::Empty)
            .await?;
        entry.key.project = target_project.to_string();
        Ok(())
    }

    /// Asks the server to rebuild the entry from its files. Valid for ready
    /// entries and entries the server left in another state (conflict,
    /// error); call [`refresh`](Self::refresh) to see the outcome.
    pub async fn rebuild(&self, entry: &PrearchiveEntry) -> Result<(), PrearchiveError> {
        require(entry, "rebuild", |s| {
            matches!(s, PrearchiveStatus::Ready | PrearchiveStatus::Other(_))
        })?;

        debug!(entry = %entry.key, "rebuilding");
        let params = vec![("action".to_string(), "rebuild".to_string())];
        self.client
            .post(&entry.key.path(), &params, RequestBody::Empty)
            .await?;
        Ok(())
    }
}

fn require(
    entry: &PrearchiveEntry,
    action: &'static str,
    allowed: impl Fn(&PrearchiveStatus) -> bool,
) -> Result<(), PrearchiveError> {
    if allowed(&entry.status) {
        Ok(())
    } else {
        Err(PrearchiveError::InvalidTransition {
            key: entry.key.clone(),
            from: entry.status.clone(),
            action,
        })
    }
}
