//! Parameters of the XNAT import service.

use serde::{Deserialize, Serialize};
use xnatctl_session::Params;
use xnatctl_transfer::TransferError;

pub const IMPORT_ENDPOINT: &str = "/data/services/import";

/// Handler used for whole-archive imports.
pub const DEFAULT_IMPORT_HANDLER: &str = "DICOM-zip";

/// Handler that ingests one DICOM file per request.
pub const GRADUAL_IMPORT_HANDLER: &str = "gradual-DICOM";

/// Where the server places imported data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Destination {
    /// Straight into the project archive.
    #[default]
    DirectArchive,
    /// Into the prearchive for review.
    Prearchive,
}

/// Target session and import behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportOptions {
    pub project: String,
    pub subject: String,
    pub session: String,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default = "default_import_handler")]
    pub import_handler: String,
    /// Value of the `overwrite` parameter (`none`, `append` or `delete`).
    #[serde(default = "default_overwrite")]
    pub overwrite: String,
    #[serde(default = "default_ignore_unparsable")]
    pub ignore_unparsable: bool,
}

fn default_import_handler() -> String {
    DEFAULT_IMPORT_HANDLER.into()
}

fn default_overwrite() -> String {
    "delete".into()
}

fn default_ignore_unparsable() -> bool {
    true
}

impl ImportOptions {
    pub fn new(project: impl Into<String>, subject: impl Into<String>, session: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            subject: subject.into(),
            session: session.into(),
            destination: Destination::default(),
            import_handler: default_import_handler(),
            overwrite: default_overwrite(),
            ignore_unparsable: default_ignore_unparsable(),
        }
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = destination;
        self
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        for (name, value) in [
            ("project", &self.project),
            ("subject", &self.subject),
            ("session", &self.session),
        ] {
            if value.trim().is_empty() {
                return Err(TransferError::Validation(format!("{name} must not be empty")));
            }
        }
        Ok(())
    }

    /// Query parameters for an archive upload.
    pub fn archive_params(&self) -> Params {
        let direct = self.destination == Destination::DirectArchive;
        let mut params: Params = vec![
            ("import-handler".into(), self.import_handler.clone()),
            ("Ignore-Unparsable".into(), self.ignore_unparsable.to_string()),
            ("project".into(), self.project.clone()),
            ("subject".into(), self.subject.clone()),
            ("session".into(), self.session.clone()),
            ("overwrite".into(), self.overwrite.clone()),
            ("overwrite_files".into(), "true".into()),
            ("quarantine".into(), "false".into()),
            ("triggerPipelines".into(), "true".into()),
            ("rename".into(), "false".into()),
            ("Direct-Archive".into(), direct.to_string()),
            ("inbody".into(), "true".into()),
        ];
        if !direct {
            params.push(("dest".into(), format!("/prearchive/projects/{}", self.project)));
        }
        params
    }

    /// Query parameters for a single-file gradual upload.
    pub fn gradual_params(&self) -> Params {
        let mut params: Params = vec![
            ("import-handler".into(), GRADUAL_IMPORT_HANDLER.into()),
            ("inbody".into(), "true".into()),
            ("PROJECT_ID".into(), self.project.clone()),
            ("SUBJECT_ID".into(), self.subject.clone()),
            ("EXPT_LABEL".into(), self.session.clone()),
        ];
        if self.destination == Destination::Prearchive {
            params.push(("dest".into(), format!("/prearchive/projects/{}", self.project)));
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value<'a>(params: &'a Params, name: &str) -> Option<&'a str> {
        params.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    #[test]
    fn direct_archive_params() {
        let params = ImportOptions::new("P1", "S1", "E1").archive_params();
        assert_eq!(value(&params, "import-handler"), Some("DICOM-zip"));
        assert_eq!(value(&params, "Direct-Archive"), Some("true"));
        assert_eq!(value(&params, "overwrite"), Some("delete"));
        assert_eq!(value(&params, "session"), Some("E1"));
        assert_eq!(value(&params, "dest"), None);
    }

    #[test]
    fn prearchive_routing() {
        let params = ImportOptions::new("P1", "S1", "E1")
            .destination(Destination::Prearchive)
            .archive_params();
        assert_eq!(value(&params, "Direct-Archive"), Some("false"));
        assert_eq!(value(&params, "dest"), Some("/prearchive/projects/P1"));
    }

    #[test]
    fn gradual_params_use_gradual_handler() {
        let params = ImportOptions::new("P1", "S1", "E1").gradual_params();
        assert_eq!(value(&params, "import-handler"), Some("gradual-DICOM"));
        assert_eq!(value(&params, "PROJECT_ID"), Some("P1"));
        assert_eq!(value(&params, "SUBJECT_ID"), Some("S1"));
        assert_eq!(value(&params, "EXPT_LABEL"), Some("E1"));
    }

    #[test]
    fn rejects_blank_target() {
        assert!(ImportOptions::new("P", " ", "E").validate().is_err());
        ImportOptions::new("P", "S", "E").validate().unwrap();
    }

    #[test]
    fn destination_from_toml_style_name() {
        let d: Destination = serde_json::from_str("\"prearchive\"").unwrap();
        assert_eq!(d, Destination::Prearchive);
        let d: Destination = serde_json::from_str("\"direct-archive\"").unwrap();
        assert_eq!(d, Destination::DirectArchive);
    }
}
