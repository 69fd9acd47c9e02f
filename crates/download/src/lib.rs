//! Session download from XNAT.
//!
//! A session is fetched either as one combined archive (`workers == 1`) or
//! as one archive per scan, several at a time. Archives are extracted into
//!
//! ```text
//! {output}/{session}/scans/{scan_id}/resources/{label}/files/...
//! {output}/{session}/resources/{label}/files/...
//! ```
//!
//! and can be checked against the server's MD5 digests.

pub mod coordinator;
pub mod extract;
pub mod plan;
pub mod types;
pub mod verify;

pub use coordinator::ParallelDownloadCoordinator;
pub use extract::{EntryMapper, extract_archive};
pub use plan::build_plan;
pub use types::{DEFAULT_DOWNLOAD_WORKERS, DownloadPlan, DownloadReport, DownloadRequest, ResourceInfo, ScanInfo};
pub use verify::{CatalogFile, scan_catalog, verify_scan};
