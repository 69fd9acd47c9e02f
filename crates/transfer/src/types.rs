use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Lifecycle of a [`TransferUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Pending,
    InFlight,
    Succeeded,
    Failed,
}

/// One schedulable piece of work: a batch archive, a single file or a scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferUnit {
    /// Stable identifier (relative path, batch number, scan ID).
    pub id: String,
    /// Local files read by an upload.
    pub sources: Vec<PathBuf>,
    /// Local destination of a download.
    pub target: Option<PathBuf>,
    pub size_bytes: u64,
    status: UnitStatus,
    last_error: Option<String>,
}

impl TransferUnit {
    pub fn new(id: impl Into<String>, sources: Vec<PathBuf>) -> Self {
        Self {
            id: id.into(),
            sources,
            target: None,
            size_bytes: 0,
            status: UnitStatus::Pending,
            last_error: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Marks the unit in flight. A failed unit may be started again.
    pub fn start(&mut self) {
        if matches!(self.status, UnitStatus::Pending | UnitStatus::Failed) {
            self.status = UnitStatus::InFlight;
        }
    }

    pub fn succeed(&mut self) {
        self.status = UnitStatus::Succeeded;
        self.last_error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = UnitStatus::Failed;
        self.last_error = Some(error.into());
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.status, UnitStatus::Succeeded | UnitStatus::Failed)
    }
}

/// Coarse stage of a transfer operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparing,
    Archiving,
    Transferring,
    Verifying,
    Complete,
    Error,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "preparing",
            Self::Archiving => "archiving",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Progress notification delivered to a [`ProgressSink`](crate::ProgressSink).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub current: usize,
    pub total: usize,
    pub message: String,
    /// Unit the event refers to, if it is about a single unit.
    pub unit_id: Option<String>,
    pub success: bool,
    pub errors: Vec<String>,
}

impl ProgressEvent {
    pub fn new(phase: Phase, current: usize, total: usize) -> Self {
        Self {
            phase,
            current,
            total,
            message: String::new(),
            unit_id: None,
            success: phase != Phase::Error,
            errors: Vec::new(),
        }
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn unit(mut self, unit_id: impl Into<String>) -> Self {
        self.unit_id = Some(unit_id.into());
        self
    }

    pub fn errors(mut self, errors: Vec<String>) -> Self {
        self.success = self.success && errors.is_empty();
        self.errors = errors;
        self
    }

    /// Fraction done in `[0, 1]`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.current as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// Failure of one unit as reported in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitError {
    pub unit_id: String,
    pub message: String,
}

/// Outcome of a coordinator run.
///
/// Always satisfies `succeeded + failed == total`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Units skipped because a resume set listed them as done.
    pub skipped: usize,
    /// Bytes moved by succeeded units.
    pub bytes: u64,
    pub elapsed: Duration,
    pub errors: Vec<UnitError>,
    /// Identifiers of succeeded units, usable as a resume set.
    pub succeeded_ids: Vec<String>,
    pub cancelled: bool,
}

impl TransferSummary {
    /// Tallies finished units. Units that never finished count as failed.
    pub fn from_units(units: &[TransferUnit], elapsed: Duration) -> Self {
        let mut summary = Self {
            total: units.len(),
            succeeded: 0,
            failed: 0,
            skipped: 0,
            bytes: 0,
            elapsed,
            errors: Vec::new(),
            succeeded_ids: Vec::new(),
            cancelled: false,
        };

        for unit in units {
            if unit.status() == UnitStatus::Succeeded {
                summary.succeeded += 1;
                summary.bytes += unit.size_bytes;
                summary.succeeded_ids.push(unit.id.clone());
            } else {
                summary.failed += 1;
                summary.errors.push(UnitError {
                    unit_id: unit.id.clone(),
                    message: unit
                        .last_error()
                        .unwrap_or("did not complete")
                        .to_string(),
                });
            }
        }
        summary
    }

    pub fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = skipped;
        self
    }

    pub fn with_cancelled(mut self, cancelled: bool) -> Self {
        self.cancelled = cancelled;
        self
    }

    /// True only when every unit succeeded and nothing was cancelled.
    pub fn is_success(&self) -> bool {
        self.failed == 0 && !self.cancelled
    }

    /// Error messages in `unit: message` form, for progress events.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|e| format!("{}: {}", e.unit_id, e.message))
            .collect()
    }
}
