//! XNAT prearchive: the staging area uploads land in before they are
//! archived into a project.
//!
//! Entries are keyed by `(project, timestamp, name)`. The
//! [`PrearchiveReconciler`] moves them through
//!
//! ```text
//! receiving -> ready -> archiving -> archived
//!                 \-> deleted
//! ```
//!
//! and keeps no state of its own: every transition is a server round-trip.

mod entry;
mod error;
mod reconciler;

pub use entry::{PrearchiveEntry, PrearchiveKey, PrearchiveStatus};
pub use error::PrearchiveError;
pub use reconciler::{ArchiveOptions, PrearchiveReconciler};
