use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use md5::{Digest, Md5};
use serde_json::{Value, json};
use xnatctl_download::{DownloadRequest, ParallelDownloadCoordinator};
use xnatctl_session::{ClientConfig, SessionClient};
use xnatctl_test_server::{MockResponse, MockServer, RecordedRequest};
use xnatctl_transfer::{CollectingSink, Phase, ProgressEvent, SharedSink, TransferError};

/// (scan id, scan type, resource, file name, content)
const FILES: &[(&str, &str, &str, &str, &str)] = &[
    ("1", "T1w", "DICOM", "a.dcm", "alpha"),
    ("1", "T1w", "DICOM", "b.dcm", "bravo"),
    ("2", "BOLD", "NIFTI", "c.nii", "charlie"),
];

#[derive(Clone, Copy, Default)]
struct Fixture {
    /// Catalog reports a wrong digest for `b.dcm`.
    bad_digest: bool,
    /// Archive requests for this scan answer 404.
    missing_scan: Option<&'static str>,
}

fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

fn zip_bytes(entries: &[(String, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in entries {
        writer.start_file(name.as_str(), options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn scan_entries(scan: Option<&str>) -> Vec<(String, &'static str)> {
    FILES
        .iter()
        .filter(|f| scan.is_none_or(|s| s == f.0))
        .map(|(id, ty, res, name, content)| {
            (format!("E1/scans/{id}-{ty}/resources/{res}/files/{name}"), *content)
        })
        .collect()
}

fn result_set(rows: Vec<Value>) -> MockResponse {
    MockResponse::json(&json!({"ResultSet": {"totalRecords": rows.len().to_string(), "Result": rows}}))
}

fn xnat(fixture: Fixture) -> impl Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static {
    move |req: &RecordedRequest| {
        if req.path == "/data/projects/P1/experiments/MR_1" {
            return MockResponse::json(&json!({"items": [{"data_fields": {"ID": "E1", "label": "MR_1"}}]}));
        }
        let zip = req.param("format") == Some("zip");
        let path = req.path.strip_prefix("/data/experiments/E1").unwrap_or("");
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        match parts.as_slice() {
            ["scans"] => result_set(vec![
                json!({"ID": "1", "type": "T1w"}),
                json!({"ID": "2", "type": "BOLD"}),
            ]),
            ["scans", scan, "resources"] => {
                let (label, size) = if *scan == "1" { ("DICOM", 10) } else { ("NIFTI", 7) };
                result_set(vec![json!({"label": label, "file_count": "1", "file_size": size})])
            }
            ["scans", "ALL", "files"] if zip => MockResponse::ok(zip_bytes(&scan_entries(None))),
            ["scans", scan, "files"] if zip => {
                if fixture.missing_scan == Some(*scan) {
                    MockResponse::status(404)
                } else {
                    MockResponse::ok(zip_bytes(&scan_entries(Some(*scan))))
                }
            }
            ["scans", scan, "resources", resource, "files"] if zip => {
                let entries: Vec<_> = FILES
                    .iter()
                    .filter(|f| f.0 == *scan && f.2 == *resource)
                    .map(|(id, ty, res, name, content)| {
                        (format!("E1/scans/{id}-{ty}/resources/{res}/files/{name}"), *content)
                    })
                    .collect();
                MockResponse::ok(zip_bytes(&entries))
            }
            ["scans", scan, "files"] => result_set(
                FILES
                    .iter()
                    .filter(|f| f.0 == *scan)
                    .map(|(id, _, res, name, content)| {
                        let digest = if fixture.bad_digest && *name == "b.dcm" {
                            md5_hex(b"something else")
                        } else {
                            md5_hex(content.as_bytes())
                        };
                        json!({
                            "Name": name,
                            "URI": format!("/data/experiments/E1/scans/{id}/resources/{res}/files/{name}"),
                            "collection": res,
                            "digest": digest,
                        })
                    })
                    .collect(),
            ),
            ["resources"] => result_set(vec![json!({"label": "NOTES", "file_count": 1, "file_size": 5})]),
            ["resources", "NOTES", "files"] if zip => MockResponse::ok(zip_bytes(&[(
                "E1/resources/NOTES/files/notes.txt".to_string(),
                "notes",
            )])),
            _ => MockResponse::status(404),
        }
    }
}

fn client(url: &str) -> SessionClient {
    SessionClient::new(
        &ClientConfig::new(url)
            .with_token("TOKEN")
            .with_max_retries(0)
            .with_backoff_base(Duration::from_millis(1)),
    )
    .unwrap()
}

fn read(root: &Path, rel: &str) -> String {
    std::fs::read_to_string(root.join(rel)).unwrap()
}

fn archive_requests(server: &MockServer) -> Vec<RecordedRequest> {
    server
        .requests()
        .into_iter()
        .filter(|r| r.param("format") == Some("zip"))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_scan_download_extracts_into_layout() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let sink = CollectingSink::new();
    let coordinator = ParallelDownloadCoordinator::new(client(server.url())).with_sink(sink.clone());
    let request = DownloadRequest::new("E1", out.path()).workers(2).verify(true);
    let report = coordinator.download(&request).await.unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.total, 2);
    assert_eq!(summary.succeeded, 2);
    assert!(summary.is_success(), "{:?}", summary.errors);

    let session = out.path().join("E1");
    assert_eq!(read(&session, "scans/1/resources/DICOM/files/a.dcm"), "alpha");
    assert_eq!(read(&session, "scans/1/resources/DICOM/files/b.dcm"), "bravo");
    assert_eq!(read(&session, "scans/2/resources/NIFTI/files/c.nii"), "charlie");
    assert!(!session.join("scan_1.zip").exists());
    assert!(!session.join("scan_2.zip").exists());

    let mut paths: Vec<String> = archive_requests(&server).into_iter().map(|r| r.path).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec!["/data/experiments/E1/scans/1/files", "/data/experiments/E1/scans/2/files"]
    );
    for req in server.requests() {
        assert_eq!(req.cookie("JSESSIONID"), Some("TOKEN"));
    }

    let events = sink.events();
    assert!(events.iter().any(|e| e.phase == Phase::Verifying));
    assert_eq!(events.last().unwrap().phase, Phase::Complete);
}

#[tokio::test]
async fn single_worker_fetches_one_combined_archive() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path()).workers(1);
    let report = coordinator.download(&request).await.unwrap();

    assert!(report.plan.combined);
    let summary = report.summary.unwrap();
    assert_eq!(summary.total, 1);
    assert!(summary.is_success());

    let archives = archive_requests(&server);
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].path, "/data/experiments/E1/scans/ALL/files");

    let session = out.path().join("E1");
    assert_eq!(read(&session, "scans/1/resources/DICOM/files/a.dcm"), "alpha");
    assert_eq!(read(&session, "scans/2/resources/NIFTI/files/c.nii"), "charlie");
}

#[tokio::test]
async fn rerun_overwrites_partial_files() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();
    let session = out.path().join("E1");

    // Leftovers of an interrupted run.
    let partial = session.join("scans/1/resources/DICOM/files/a.dcm");
    std::fs::create_dir_all(partial.parent().unwrap()).unwrap();
    std::fs::write(&partial, b"alp").unwrap();
    std::fs::write(session.join("scan_1.zip.part"), b"PK\x03").unwrap();
    std::fs::write(session.join("scan_2.zip"), b"truncated").unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path()).workers(2);
    let first = coordinator.download(&request).await.unwrap().summary.unwrap();
    assert!(first.is_success(), "{:?}", first.errors);

    assert_eq!(read(&session, "scans/1/resources/DICOM/files/a.dcm"), "alpha");
    assert!(!session.join("scan_1.zip.part").exists());
    assert!(!session.join("scan_2.zip").exists());

    let second = coordinator.download(&request).await.unwrap().summary.unwrap();
    assert!(second.is_success());
    assert_eq!(read(&session, "scans/1/resources/DICOM/files/b.dcm"), "bravo");
}

#[tokio::test]
async fn checksum_mismatch_fails_scan_but_keeps_files() {
    let fixture = Fixture {
        bad_digest: true,
        ..Fixture::default()
    };
    let server = MockServer::start(xnat(fixture)).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path()).workers(2).verify(true);
    let summary = coordinator.download(&request).await.unwrap().summary.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors[0].unit_id, "scan-1");
    assert!(summary.errors[0].message.contains("checksum mismatch"), "{}", summary.errors[0].message);
    assert!(summary.errors[0].message.contains("b.dcm"));

    let session = out.path().join("E1");
    assert_eq!(read(&session, "scans/1/resources/DICOM/files/b.dcm"), "bravo");
}

#[tokio::test]
async fn failed_scan_does_not_stop_the_others() {
    let fixture = Fixture {
        missing_scan: Some("2"),
        ..Fixture::default()
    };
    let server = MockServer::start(xnat(fixture)).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let sink = CollectingSink::new();
    let coordinator = ParallelDownloadCoordinator::new(client(server.url())).with_sink(sink.clone());
    let request = DownloadRequest::new("E1", out.path()).workers(4);
    let summary = coordinator.download(&request).await.unwrap().summary.unwrap();

    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.errors[0].unit_id, "scan-2");
    assert!(!out.path().join("E1/scan_2.zip.part").exists());

    let last = sink.events().last().cloned().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(last.errors.len(), 1);
}

#[tokio::test]
async fn dry_run_reports_plan_without_transfers() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path()).include_resources(true).dry_run(true);
    let report = coordinator.download(&request).await.unwrap();

    assert!(report.summary.is_none());
    assert_eq!(report.plan.scan_ids(), vec!["1", "2"]);
    assert_eq!(report.plan.resources[0].label, "NOTES");
    assert_eq!(report.plan.approximate_bytes(), 10 + 7 + 5);
    assert!(archive_requests(&server).is_empty());
    assert!(!out.path().join("E1").exists());
}

#[tokio::test]
async fn session_resources_and_archives_can_be_kept() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path())
        .session_label("MR_001")
        .scans(vec!["2".into()])
        .include_resources(true)
        .cleanup_archives(false)
        .workers(2);
    let summary = coordinator.download(&request).await.unwrap().summary.unwrap();

    assert_eq!(summary.total, 2);
    assert!(summary.is_success(), "{:?}", summary.errors);

    let session = out.path().join("MR_001");
    assert_eq!(read(&session, "resources/NOTES/files/notes.txt"), "notes");
    assert_eq!(read(&session, "scans/2/resources/NIFTI/files/c.nii"), "charlie");
    assert!(!session.join("scans/1").exists());
    assert!(session.join("scan_2.zip").is_file());
    assert!(session.join("resource_NOTES.zip").is_file());
}

#[tokio::test]
async fn unknown_scan_is_rejected_before_transfer() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path()).scans(vec!["1".into(), "99".into()]);
    let err = coordinator.download(&request).await.unwrap_err();

    assert!(matches!(err, TransferError::Validation(ref m) if m.contains("99")), "{err}");
    assert!(archive_requests(&server).is_empty());
}

#[tokio::test]
async fn cancelled_download_fetches_nothing() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    coordinator.cancel_token().cancel();
    let request = DownloadRequest::new("E1", out.path()).workers(2);
    let summary = coordinator.download(&request).await.unwrap().summary.unwrap();

    assert!(summary.cancelled);
    assert_eq!(summary.failed, 2);
    assert!(summary.errors.iter().all(|e| e.message == "cancelled before transfer"));
    assert!(archive_requests(&server).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resource_filter_fetches_only_that_resource() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path())
        .workers(2)
        .resource("DICOM")
        .verify(true);
    let report = coordinator.download(&request).await.unwrap();

    let summary = report.summary.unwrap();
    assert!(summary.is_success(), "{:?}", summary.errors);
    let mut paths: Vec<String> = archive_requests(&server).into_iter().map(|r| r.path).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec![
            "/data/experiments/E1/scans/1/resources/DICOM/files",
            "/data/experiments/E1/scans/2/resources/DICOM/files",
        ]
    );

    let session = out.path().join("E1");
    assert_eq!(read(&session, "scans/1/resources/DICOM/files/a.dcm"), "alpha");
    assert!(!session.join("scans/2/resources/NIFTI/files/c.nii").exists());
}

#[tokio::test]
async fn resource_filter_narrows_the_dry_run_plan() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("E1", out.path()).resource("DICOM").dry_run(true);
    let plan = coordinator.download(&request).await.unwrap().plan;

    assert_eq!(plan.resource.as_deref(), Some("DICOM"));
    assert_eq!(plan.scans[0].resources.len(), 1);
    assert!(plan.scans[1].resources.is_empty());
    assert_eq!(plan.approximate_bytes(), 10);
}

#[tokio::test]
async fn session_label_is_resolved_through_project() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("MR_1", out.path()).project("P1").workers(1);
    let report = coordinator.download(&request).await.unwrap();

    assert_eq!(report.plan.session_id, "E1");
    assert!(report.summary.unwrap().is_success());
    let archives = archive_requests(&server);
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].path, "/data/experiments/E1/scans/ALL/files");
    assert_eq!(read(&out.path().join("MR_1"), "scans/1/resources/DICOM/files/a.dcm"), "alpha");
}

#[tokio::test]
async fn unknown_session_label_is_a_validation_error() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let coordinator = ParallelDownloadCoordinator::new(client(server.url()));
    let request = DownloadRequest::new("MR_9", out.path()).project("P1");
    let err = coordinator.download(&request).await.unwrap_err();

    assert!(matches!(err, TransferError::Validation(_)), "{err}");
    assert!(err.to_string().contains("MR_9"));
    assert!(archive_requests(&server).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_unit_is_failed_with_an_error_event() {
    let server = MockServer::start(xnat(Fixture::default())).await.unwrap();
    let out = tempfile::TempDir::new().unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&events);
    let sink: SharedSink = Arc::new(move |event: ProgressEvent| {
        if event.phase == Phase::Transferring && event.unit_id.as_deref() == Some("scan-2") {
            panic!("sink exploded");
        }
        seen.lock().unwrap().push(event);
    });
    let coordinator = ParallelDownloadCoordinator::new(client(server.url())).with_sink(sink);
    let report = coordinator
        .download(&DownloadRequest::new("E1", out.path()).workers(2))
        .await
        .unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].unit_id, "scan-2");
    assert!(summary.errors[0].message.contains("panicked"), "{}", summary.errors[0].message);
    let events = events.lock().unwrap();
    assert!(
        events
            .iter()
            .any(|e| e.phase == Phase::Error && e.unit_id.as_deref() == Some("scan-2"))
    );
}
