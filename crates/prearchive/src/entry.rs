use std::fmt;

use serde::Serialize;
use serde_json::Value;

/// Lifecycle state of a prearchive entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PrearchiveStatus {
    Receiving,
    Ready,
    Archiving,
    Archived,
    Deleted,
    /// Any other server status, e.g. `BUILDING`, `CONFLICT` or `ERROR`.
    Other(String),
}

impl PrearchiveStatus {
    /// Maps a server status string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "RECEIVING" => Self::Receiving,
            "READY" => Self::Ready,
            "ARCHIVING" | "_ARCHIVING" => Self::Archiving,
            "ARCHIVED" => Self::Archived,
            "DELETED" => Self::Deleted,
            _ => Self::Other(raw.trim().to_string()),
        }
    }

    /// Archived and deleted entries no longer exist under their key.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Archived | Self::Deleted)
    }
}

impl fmt::Display for PrearchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Receiving => f.write_str("receiving"),
            Self::Ready => f.write_str("ready"),
            Self::Archiving => f.write_str("archiving"),
            Self::Archived => f.write_str("archived"),
            Self::Deleted => f.write_str("deleted"),
            Self::Other(raw) => f.write_str(raw),
        }
    }
}

/// Composite identity of a prearchive entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PrearchiveKey {
    pub project: String,
    pub timestamp: String,
    pub name: String,
}

impl PrearchiveKey {
    pub fn new(project: impl Into<String>, timestamp: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            timestamp: timestamp.into(),
            name: name.into(),
        }
    }

    /// REST path of the entry.
    pub fn path(&self) -> String {
        format!(
            "/data/prearchive/projects/{}/{}/{}",
            self.project, self.timestamp, self.name
        )
    }
}

impl fmt::Display for PrearchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.timestamp, self.name)
    }
}

/// An entry as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrearchiveEntry {
    pub key: PrearchiveKey,
    pub status: PrearchiveStatus,
    pub subject: Option<String>,
    pub scan_date: Option<String>,
    pub uploaded: Option<String>,
}

impl PrearchiveEntry {
    /// Builds an entry from one row of a prearchive listing.
    ///
    /// Rows without project, timestamp or name are ignored.
    pub fn from_row(row: &Value) -> Option<Self> {
        let field = |key: &str| {
            row.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        let name = field("name").or_else(|| field("folderName"))?;
        Some(Self {
            key: PrearchiveKey::new(field("project")?, field("timestamp")?, name),
            status: PrearchiveStatus::parse(&field("status").unwrap_or_default()),
            subject: field("subject"),
            scan_date: field("scan_date"),
            uploaded: field("uploaded"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_server_statuses() {
        assert_eq!(PrearchiveStatus::parse("READY"), PrearchiveStatus::Ready);
        assert_eq!(PrearchiveStatus::parse("receiving"), PrearchiveStatus::Receiving);
        assert_eq!(PrearchiveStatus::parse("_ARCHIVING"), PrearchiveStatus::Archiving);
        assert_eq!(
            PrearchiveStatus::parse("CONFLICT"),
            PrearchiveStatus::Other("CONFLICT".into())
        );
        assert!(PrearchiveStatus::Archived.is_terminal());
        assert!(!PrearchiveStatus::Other("ERROR".into()).is_terminal());
    }

    #[test]
    fn entry_from_listing_row() {
        let entry = PrearchiveEntry::from_row(&json!({
            "project": "PROJ01",
            "timestamp": "20240115_120000",
            "name": "session_01",
            "status": "READY",
            "subject": "SUBJ01",
            "scan_date": ""
        }))
        .unwrap();
        assert_eq!(entry.key.to_string(), "PROJ01/20240115_120000/session_01");
        assert_eq!(
            entry.key.path(),
            "/data/prearchive/projects/PROJ01/20240115_120000/session_01"
        );
        assert_eq!(entry.status, PrearchiveStatus::Ready);
        assert_eq!(entry.subject.as_deref(), Some("SUBJ01"));
        assert_eq!(entry.scan_date, None);
    }

    #[test]
    fn incomplete_rows_are_ignored() {
        assert!(PrearchiveEntry::from_row(&json!({"project": "P", "name": "n"})).is_none());
        let entry =
            PrearchiveEntry::from_row(&json!({"project": "P", "timestamp": "t", "folderName": "f"})).unwrap();
        assert_eq!(entry.key.name, "f");
        assert_eq!(entry.status, PrearchiveStatus::Other(String::new()));
    }
}
