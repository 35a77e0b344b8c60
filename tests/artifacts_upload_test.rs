//! Object-store upload behavior against a mock HTTP endpoint.

use std::collections::BTreeMap;

use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mcp_analyst_toolkit::artifacts::{
    build_artifact_contract, fold_status_with_artifacts, ArtifactExpectations, ArtifactPublisher,
};
use mcp_analyst_toolkit::config::ArtifactConfig;
use mcp_analyst_toolkit::dataset::Dataset;

fn publisher_for(server: &MockServer) -> ArtifactPublisher {
    ArtifactPublisher::new(&ArtifactConfig {
        bucket: "gs://test-reports".to_string(),
        prefix: "analyst_toolkit/reports".to_string(),
        endpoint: server.uri(),
    })
}

async fn local_report(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let file = dir.path().join("report.html");
    tokio::fs::write(&file, b"<html>report</html>").await.unwrap();
    file
}

#[tokio::test]
async fn test_upload_success_returns_public_url() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path(
            "/test-reports/analyst_toolkit/reports/run_1/sess_a/diagnostics/report.html",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = local_report(&dir).await;
    let url = publisher_for(&server)
        .upload_artifact(&file, "run_1", "diagnostics", Some("sess_a"))
        .await;
    assert_eq!(
        url,
        format!(
            "{}/test-reports/analyst_toolkit/reports/run_1/sess_a/diagnostics/report.html",
            server.uri()
        )
    );
}

#[tokio::test]
async fn test_upload_retries_once_under_alternate_key() {
    let server = MockServer::start().await;
    // Primary key is denied (e.g. overwrite without delete permission).
    Mock::given(method("PUT"))
        .and(path(
            "/test-reports/analyst_toolkit/reports/run_1/diagnostics/report.html",
        ))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    // The alternate key carries a random 8-hex suffix.
    Mock::given(method("PUT"))
        .and(path_regex(
            r"^/test-reports/analyst_toolkit/reports/run_1/diagnostics/report_[0-9a-f]{8}\.html$",
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = local_report(&dir).await;
    let url = publisher_for(&server)
        .upload_artifact(&file, "run_1", "diagnostics", None)
        .await;
    assert!(!url.is_empty());
    assert_ne!(
        url,
        format!(
            "{}/test-reports/analyst_toolkit/reports/run_1/diagnostics/report.html",
            server.uri()
        ),
        "alternate key must differ from the primary canonical path"
    );
    assert!(url.contains("/report_"));
}

#[tokio::test]
async fn test_upload_double_failure_returns_empty() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = local_report(&dir).await;
    let url = publisher_for(&server)
        .upload_artifact(&file, "run_1", "diagnostics", None)
        .await;
    assert_eq!(url, "");
}

#[tokio::test]
async fn test_upload_missing_file_is_empty_without_requests() {
    let server = MockServer::start().await;
    // No mounted mocks: any request would fail the test via 404 + expect checks.
    let url = publisher_for(&server)
        .upload_artifact(
            std::path::Path::new("/definitely/not/here.html"),
            "run_1",
            "diagnostics",
            None,
        )
        .await;
    assert_eq!(url, "");
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_output_remote_staged_upload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/data-bucket/exports/run_1/out.csv"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let publisher = publisher_for(&server);
    let ds = Dataset::from_csv("a,b\n1,2\n");
    let path = publisher
        .save_output(&ds, "gs://data-bucket/exports/run_1/out.csv")
        .await
        .unwrap();
    assert_eq!(path, "gs://data-bucket/exports/run_1/out.csv");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].body, b"a,b\n1,2\n");
}

#[tokio::test]
async fn test_save_output_remote_alternate_key_on_failure() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/data-bucket/exports/out.csv"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path_regex(r"^/data-bucket/exports/out_[0-9a-f]{8}\.csv$"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let publisher = publisher_for(&server);
    let ds = Dataset::from_csv("a\n1\n");
    let path = publisher
        .save_output(&ds, "gs://data-bucket/exports/out.csv")
        .await
        .unwrap();
    assert!(path.starts_with("gs://data-bucket/exports/out_"));
    assert!(path.ends_with(".csv"));
}

#[tokio::test]
async fn test_save_output_remote_double_failure_is_error() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let publisher = publisher_for(&server);
    let ds = Dataset::from_csv("a\n1\n");
    let err = publisher
        .save_output(&ds, "gs://data-bucket/exports/out.csv")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("export upload failed"));
}

#[tokio::test]
async fn test_contract_folds_upload_results() {
    // A successful upload plus a failed (empty) HTML upload: the contract
    // marks html_report missing and the status folds to warn.
    let contract = build_artifact_contract(&ArtifactExpectations {
        export_url: "gs://test-reports/exports/out.csv".to_string(),
        html_url: String::new(),
        expect_html: true,
        required_html: true,
        plot_urls: BTreeMap::new(),
        ..Default::default()
    });
    assert_eq!(contract.uploaded_artifacts, vec!["data_export"]);
    assert_eq!(contract.missing_required_artifacts, vec!["html_report"]);
    assert_eq!(
        fold_status_with_artifacts("pass", &contract.missing_required_artifacts),
        "warn"
    );
    assert_eq!(
        fold_status_with_artifacts("fail", &contract.missing_required_artifacts),
        "fail"
    );
}
