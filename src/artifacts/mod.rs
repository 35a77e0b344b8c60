//! Artifact publication: best-effort uploads to a remote object store plus
//! the structured contract describing expected vs. delivered outputs.
//!
//! Upload failures never abort a pipeline run. The publisher returns an
//! empty URL as the error signal and callers fold that into the artifact
//! contract as a `missing` entry with a reason, downgrading the tool status
//! to `warn` when a required artifact is absent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ArtifactConfig;
use crate::dataset::Dataset;
use crate::error::{ToolError, ToolResult};

fn content_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("html") => "text/html",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("csv") => "text/csv",
        Some("json") => "application/json",
        Some("png") => "image/png",
        _ => "application/octet-stream",
    }
}

/// Uploads report/export files and builds public URLs.
///
/// Disabled (empty bucket) publishers return empty URLs from every upload,
/// which downstream contract building reports as `missing`/`disabled`.
pub struct ArtifactPublisher {
    bucket: String,
    prefix: String,
    endpoint: String,
    client: reqwest::Client,
}

impl ArtifactPublisher {
    pub fn new(config: &ArtifactConfig) -> Self {
        Self {
            bucket: config
                .bucket
                .strip_prefix("gs://")
                .unwrap_or(&config.bucket)
                .to_string(),
            prefix: config.prefix.clone(),
            endpoint: config.endpoint.clone(),
            client: reqwest::Client::new(),
        }
    }

    /// Whether uploads are configured at all.
    pub fn is_enabled(&self) -> bool {
        !self.bucket.is_empty()
    }

    /// Upload one local file to `{prefix}/{path_root}/{module}/{filename}`.
    ///
    /// Best-effort: a failed primary upload is retried exactly once under an
    /// alternate key carrying a random suffix (covers idempotent reruns where
    /// same-key overwrite permissions vary). Returns the public URL, or an
    /// empty string when uploads are disabled, the file is missing, or both
    /// attempts fail.
    pub async fn upload_artifact(
        &self,
        local_path: &Path,
        run_id: &str,
        module: &str,
        session_id: Option<&str>,
    ) -> String {
        if !self.is_enabled() {
            return String::new();
        }
        let bytes = match tokio::fs::read(local_path).await {
            Ok(bytes) => bytes,
            Err(_) => return String::new(),
        };
        let filename = match local_path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => return String::new(),
        };

        let path_root = resolve_path_root(run_id, session_id);
        let content_type = content_type_for(local_path);
        let blob_path = format!("{}/{path_root}/{module}/{filename}", self.prefix);

        match self.put_object(&blob_path, bytes.clone(), content_type).await {
            Ok(url) => url,
            Err(first_err) => {
                let alt_path = versioned_blob_path(&blob_path);
                match self.put_object(&alt_path, bytes, content_type).await {
                    Ok(url) => {
                        debug!(blob = %alt_path, "Primary upload failed, alternate key succeeded");
                        url
                    }
                    Err(_) => {
                        warn!(
                            error = %first_err,
                            alternate = %alt_path,
                            "Artifact upload failed for primary and fallback paths"
                        );
                        String::new()
                    }
                }
            }
        }
    }

    /// Export a dataset as CSV to a local path or a `gs://bucket/key` URI.
    ///
    /// Remote writes stage through a named temp file first so a failed
    /// upload never leaves a half-written object behind; the temp file is
    /// removed on every exit path. Local writes create parent directories
    /// and return the absolute path.
    pub async fn save_output(&self, dataset: &Dataset, path: &str) -> ToolResult<String> {
        let csv = dataset.to_csv();

        if let Some(stripped) = path.strip_prefix("gs://") {
            let (bucket, blob_path) = stripped.split_once('/').ok_or_else(|| {
                ToolError::Validation {
                    field: "path".to_string(),
                    reason: format!("invalid object store path: {path}"),
                }
            })?;
            if bucket.is_empty() || blob_path.is_empty() {
                return Err(ToolError::Validation {
                    field: "path".to_string(),
                    reason: format!("invalid object store path: {path}"),
                });
            }

            let staged = tempfile::NamedTempFile::new().map_err(|e| ToolError::Execution {
                message: format!("failed to stage export: {e}"),
            })?;
            tokio::fs::write(staged.path(), csv.as_bytes())
                .await
                .map_err(|e| ToolError::Execution {
                    message: format!("failed to stage export: {e}"),
                })?;
            let bytes = tokio::fs::read(staged.path())
                .await
                .map_err(|e| ToolError::Execution {
                    message: format!("failed to stage export: {e}"),
                })?;

            let first = self
                .put_to_bucket(bucket, blob_path, bytes.clone(), "text/csv")
                .await;
            return match first {
                Ok(_) => Ok(path.to_string()),
                Err(first_err) => {
                    let alt_path = versioned_blob_path(blob_path);
                    match self.put_to_bucket(bucket, &alt_path, bytes, "text/csv").await {
                        Ok(_) => Ok(format!("gs://{bucket}/{alt_path}")),
                        Err(_) => Err(ToolError::Execution {
                            message: format!("export upload failed: {first_err}"),
                        }),
                    }
                }
            };
        }

        let target = PathBuf::from(path);
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ToolError::Execution {
                        message: format!("failed to create {}: {e}", parent.display()),
                    })?;
            }
        }
        tokio::fs::write(&target, csv.as_bytes())
            .await
            .map_err(|e| ToolError::Execution {
                message: format!("local export write failed for {}: {e}", target.display()),
            })?;
        let absolute = if target.is_absolute() {
            target
        } else {
            std::env::current_dir()
                .map_err(|e| ToolError::Execution {
                    message: format!("failed to resolve {}: {e}", target.display()),
                })?
                .join(target)
        };
        Ok(absolute.display().to_string())
    }

    async fn put_object(
        &self,
        blob_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, reqwest::Error> {
        self.put_to_bucket(&self.bucket, blob_path, bytes, content_type)
            .await
    }

    async fn put_to_bucket(
        &self,
        bucket: &str,
        blob_path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, reqwest::Error> {
        let url = format!("{}/{bucket}/{blob_path}", self.endpoint);
        self.client
            .put(&url)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?;
        Ok(url)
    }
}

/// Object-store folder shared by all artifacts of one (run, session) scope.
fn resolve_path_root(run_id: &str, session_id: Option<&str>) -> String {
    match session_id {
        Some(session) if !session.is_empty() => format!("{run_id}/{session}"),
        _ => run_id.to_string(),
    }
}

/// `report.html` -> `report_<8hex>.html`, keeping the directory part.
fn versioned_blob_path(blob_path: &str) -> String {
    let path = Path::new(blob_path);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("blob");
    let suffix = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();
    let alt_name = format!("{stem}_{}{suffix}", &Uuid::new_v4().simple().to_string()[..8]);
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => format!("{}/{alt_name}", parent.display()),
        None => alt_name,
    }
}

/// Normalize a caller-supplied input path: bucket-like bare paths that do
/// not exist locally are promoted to `gs://` URIs. Returns the normalized
/// path and an optional note describing the rewrite.
pub fn normalize_input_path(path: &str) -> (String, Option<String>) {
    let stripped = path.trim();
    if stripped.starts_with("gs://") {
        return (stripped.to_string(), None);
    }
    if looks_like_bucket_path(stripped) && !Path::new(stripped).exists() {
        return (
            format!("gs://{stripped}"),
            Some(format!("Auto-normalized bucket-like input path to gs://{stripped}")),
        );
    }
    (stripped.to_string(), None)
}

fn looks_like_bucket_path(path: &str) -> bool {
    if path.is_empty() || path.contains("://") || path.contains('\\') {
        return false;
    }
    if path.starts_with('/') || path.starts_with('.') || path.starts_with('~') {
        return false;
    }
    let Some((bucket, prefix)) = path.split_once('/') else {
        return false;
    };
    let bucket = bucket.trim();
    let prefix = prefix.trim();
    if bucket.is_empty() || prefix.is_empty() {
        return false;
    }
    // Plain directory names are not buckets; require a dash or dot.
    if !bucket.contains('-') && !bucket.contains('.') {
        return false;
    }
    if bucket.len() < 3 || bucket.len() > 222 {
        return false;
    }
    let valid_inner = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let edges_ok = bucket.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && bucket.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    valid_inner && edges_ok
}

/// Per-artifact delivery report embedded in tool results.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactContract {
    /// Per-artifact `{expected, required, status, url, reason}` entries.
    pub artifact_matrix: Value,
    pub expected_artifacts: Vec<String>,
    pub uploaded_artifacts: Vec<String>,
    pub missing_required_artifacts: Vec<String>,
    pub artifact_warnings: Vec<String>,
}

/// Which artifacts a tool invocation promised, and the URLs it actually got.
#[derive(Debug, Clone, Default)]
pub struct ArtifactExpectations {
    pub export_url: String,
    pub html_url: String,
    pub xlsx_url: String,
    pub plot_urls: BTreeMap<String, String>,
    pub expect_html: bool,
    pub expect_xlsx: bool,
    pub expect_plots: bool,
    pub required_html: bool,
    pub required_xlsx: bool,
}

/// Build the contract comparing expected vs. delivered artifacts.
///
/// The data export is always expected and required. Statuses are
/// `available`, `missing`, or `disabled`; every missing required artifact
/// produces a warning line, and a local (non-URL) export path gets a
/// portability warning since the client may not share the server's
/// filesystem.
pub fn build_artifact_contract(exp: &ArtifactExpectations) -> ArtifactContract {
    let (export_status, export_reason) = resolve_data_export_status(&exp.export_url);

    let matrix = json!({
        "data_export": {
            "expected": true,
            "required": true,
            "status": export_status,
            "url": exp.export_url,
            "reason": export_reason,
        },
        "html_report": {
            "expected": exp.expect_html,
            "required": exp.required_html && exp.expect_html,
            "status": if !exp.expect_html {
                "disabled"
            } else if !exp.html_url.is_empty() {
                "available"
            } else {
                "missing"
            },
            "url": if exp.expect_html { exp.html_url.as_str() } else { "" },
            "reason": if !exp.expect_html {
                "disabled"
            } else if exp.html_url.is_empty() {
                "upload_failed_or_not_generated"
            } else {
                ""
            },
        },
        "xlsx_report": {
            "expected": exp.expect_xlsx,
            "required": exp.required_xlsx && exp.expect_xlsx,
            "status": if !exp.expect_xlsx {
                "disabled"
            } else if !exp.xlsx_url.is_empty() {
                "available"
            } else {
                "missing"
            },
            "url": if exp.expect_xlsx { exp.xlsx_url.as_str() } else { "" },
            "reason": if !exp.expect_xlsx {
                "disabled"
            } else if exp.xlsx_url.is_empty() {
                "upload_failed_or_not_generated"
            } else {
                ""
            },
        },
        "plots": {
            "expected": exp.expect_plots,
            "required": false,
            "status": if !exp.expect_plots {
                "disabled"
            } else if !exp.plot_urls.is_empty() {
                "available"
            } else {
                "missing"
            },
            "count": if exp.expect_plots { exp.plot_urls.len() } else { 0 },
            "urls": if exp.expect_plots { json!(exp.plot_urls) } else { json!({}) },
            "reason": if !exp.expect_plots {
                "disabled"
            } else if exp.plot_urls.is_empty() {
                "not_generated_or_upload_failed"
            } else {
                ""
            },
        },
    });

    let entry = |name: &str| &matrix[name];
    let names = ["data_export", "html_report", "xlsx_report", "plots"];

    let expected: Vec<String> = names
        .iter()
        .filter(|n| entry(n)["expected"] == json!(true))
        .map(|n| n.to_string())
        .collect();
    let uploaded: Vec<String> = names
        .iter()
        .filter(|n| {
            let item = entry(n);
            item["status"] == json!("available")
                && (item["url"].as_str().is_some_and(|u| !u.is_empty())
                    || (**n == "plots" && item["count"].as_u64().unwrap_or(0) > 0))
        })
        .map(|n| n.to_string())
        .collect();
    let missing_required: Vec<String> = names
        .iter()
        .filter(|n| {
            let item = entry(n);
            item["required"] == json!(true) && item["status"] != json!("available")
        })
        .map(|n| n.to_string())
        .collect();

    let mut warnings: Vec<String> = missing_required
        .iter()
        .map(|name| {
            let reason = matrix[name]["reason"].as_str().unwrap_or("missing");
            let reason = if reason.is_empty() { "missing" } else { reason };
            format!("Missing required artifact: {name} ({reason})")
        })
        .collect();
    if export_reason == "server_local_path" {
        warnings.push(
            "Data export path is local to the server runtime filesystem and may not be \
             directly accessible from the client host."
                .to_string(),
        );
    }

    ArtifactContract {
        artifact_matrix: matrix,
        expected_artifacts: expected,
        uploaded_artifacts: uploaded,
        missing_required_artifacts: missing_required,
        artifact_warnings: warnings,
    }
}

/// Fold artifact delivery into a tool status: `error`/`fail` are never
/// downgraded, while a passing result with missing required artifacts
/// becomes `warn`.
pub fn fold_status_with_artifacts(status: &str, missing_required_artifacts: &[String]) -> String {
    if status == "error" || status == "fail" {
        return status.to_string();
    }
    if !missing_required_artifacts.is_empty() {
        return "warn".to_string();
    }
    status.to_string()
}

fn resolve_data_export_status(export_url: &str) -> (&'static str, &'static str) {
    if export_url.is_empty() {
        return ("missing", "upload_failed");
    }
    if export_url.starts_with("gs://") || export_url.starts_with("http") {
        return ("available", "");
    }
    if Path::new(export_url).exists() {
        return ("available", "server_local_path");
    }
    ("missing", "local_path_not_found")
}
