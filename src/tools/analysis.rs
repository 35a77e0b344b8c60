//! Dataset-facing tools: per-column diagnostics and rule-based validation.
//!
//! These are deliberately thin stand-ins for the heavier statistical
//! modules; the interesting parts here are the shared mechanics every data
//! tool goes through: load, session save with run binding, export with an
//! artifact contract, history append, and the open-record outcome.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::artifacts::{build_artifact_contract, fold_status_with_artifacts, ArtifactExpectations};
use crate::dataset::Dataset;
use crate::error::{StoreError, ToolError, ToolResult};

use super::{load_dataset, new_run_id, opt_bool, opt_str, ToolContext, ToolDescriptor, ToolHandler};

/// Per-column profile of a dataset.
pub struct DiagnosticsTool;

#[async_trait]
impl ToolHandler for DiagnosticsTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_diagnostics".to_string(),
            description: "Profile a dataset per column (null counts, distinct values, \
                          numeric min/max/mean), save it to a session, export the data, \
                          and record the outcome in the run history."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "rows": {"type": "array", "items": {"type": "object"}},
                    "session_id": {"type": "string"},
                    "path": {"type": "string"},
                    "run_id": {"type": "string"},
                    "export": {"type": "boolean", "default": true},
                    "run_async": {"type": "boolean", "default": false}
                }
            }),
        }
    }

    fn supports_async(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
        let dataset = load_dataset(ctx, &args).await?;
        let (run_id, session_id, mut warnings) = bind_session(ctx, &dataset, &args)?;

        let profile = profile_columns(&dataset);
        let mut status = "pass".to_string();

        let mut outcome = Map::new();
        if opt_bool(&args, "export", true) {
            let export_url = export_dataset(ctx, &dataset, &run_id, "diagnostics", &session_id).await?;
            let contract = build_artifact_contract(&ArtifactExpectations {
                export_url,
                ..Default::default()
            });
            status = fold_status_with_artifacts(&status, &contract.missing_required_artifacts);
            warnings.extend(contract.artifact_warnings.clone());
            outcome.insert("artifacts".to_string(), serde_json::to_value(&contract)?);
        }

        let summary = json!({
            "dataset": dataset.summary(),
            "columns": profile,
        });

        append_history(ctx, "diagnostics", &status, &run_id, &session_id, &summary).await;

        outcome.insert("status".to_string(), json!(status));
        outcome.insert("module".to_string(), json!("diagnostics"));
        outcome.insert("run_id".to_string(), json!(run_id));
        outcome.insert("session_id".to_string(), json!(session_id));
        outcome.insert("summary".to_string(), summary);
        if !warnings.is_empty() {
            outcome.insert("warnings".to_string(), json!(warnings));
        }
        Ok(Value::Object(outcome))
    }
}

/// Rule checks from the `config` argument: required columns and numeric
/// range bounds.
pub struct ValidationTool;

#[async_trait]
impl ToolHandler for ValidationTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_validation".to_string(),
            description: "Validate a dataset against required-column and numeric range \
                          rules from the config argument; pass/fail status with per-check \
                          details, recorded in the run history."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "rows": {"type": "array", "items": {"type": "object"}},
                    "session_id": {"type": "string"},
                    "path": {"type": "string"},
                    "run_id": {"type": "string"},
                    "config": {
                        "type": "object",
                        "properties": {
                            "required_columns": {"type": "array", "items": {"type": "string"}},
                            "ranges": {"type": "object"}
                        }
                    },
                    "export": {"type": "boolean", "default": false},
                    "run_async": {"type": "boolean", "default": false}
                },
                "required": ["config"]
            }),
        }
    }

    fn supports_async(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
        let config = args
            .get("config")
            .and_then(|c| c.as_object())
            .ok_or_else(|| ToolError::Validation {
                field: "config".to_string(),
                reason: "required object with validation rules".to_string(),
            })?
            .clone();

        let dataset = load_dataset(ctx, &args).await?;
        let (run_id, session_id, mut warnings) = bind_session(ctx, &dataset, &args)?;

        let checks = run_checks(&dataset, &config)?;
        let failed: Vec<&Value> = checks
            .iter()
            .filter(|c| c["ok"] == json!(false))
            .collect();
        let mut status = if failed.is_empty() { "pass" } else { "fail" }.to_string();

        let mut outcome = Map::new();
        if opt_bool(&args, "export", false) {
            let export_url = export_dataset(ctx, &dataset, &run_id, "validation", &session_id).await?;
            let contract = build_artifact_contract(&ArtifactExpectations {
                export_url,
                ..Default::default()
            });
            status = fold_status_with_artifacts(&status, &contract.missing_required_artifacts);
            warnings.extend(contract.artifact_warnings.clone());
            outcome.insert("artifacts".to_string(), serde_json::to_value(&contract)?);
        }

        let summary = json!({
            "dataset": dataset.summary(),
            "checks_total": checks.len(),
            "checks_failed": failed.len(),
        });

        append_history(ctx, "validation", &status, &run_id, &session_id, &summary).await;

        outcome.insert("status".to_string(), json!(status));
        outcome.insert("module".to_string(), json!("validation"));
        outcome.insert("run_id".to_string(), json!(run_id));
        outcome.insert("session_id".to_string(), json!(session_id));
        outcome.insert("summary".to_string(), summary);
        outcome.insert("checks".to_string(), json!(checks));
        if !warnings.is_empty() {
            outcome.insert("warnings".to_string(), json!(warnings));
        }
        Ok(Value::Object(outcome))
    }
}

/// Save the dataset to its session and resolve the effective run id. A run
/// id mismatch against a bound session is coerced (with a warning) or
/// rejected depending on store policy.
fn bind_session(
    ctx: &ToolContext,
    dataset: &Dataset,
    args: &Value,
) -> ToolResult<(String, String, Vec<String>)> {
    let requested_run = opt_str(args, "run_id");
    let requested_session = opt_str(args, "session_id");

    let mut warnings = Vec::new();
    if let Some(session_id) = &requested_session {
        if ctx.sessions.get_metadata(session_id).is_some() {
            let resolved = ctx
                .sessions
                .resolve_run_id(session_id, requested_run.as_deref())
                .map_err(map_store_error)?;
            warnings.extend(resolved.warning);
        }
    }

    let run_id = requested_session
        .as_deref()
        .and_then(|s| ctx.sessions.bound_run_id(s))
        .or(requested_run)
        .unwrap_or_else(new_run_id);

    let session_id = ctx
        .sessions
        .save(
            dataset.clone(),
            requested_session.as_deref(),
            Some(&run_id),
        )
        .map_err(map_store_error)?;

    Ok((run_id, session_id, warnings))
}

fn map_store_error(err: StoreError) -> ToolError {
    match err {
        StoreError::RunIdMismatch { .. } => ToolError::Validation {
            field: "run_id".to_string(),
            reason: err.to_string(),
        },
        other => ToolError::Session(other.to_string()),
    }
}

/// Export the dataset as CSV under the run's export folder, preferring the
/// uploaded URL when the publisher is enabled. Export failure is additive:
/// it degrades the artifact contract rather than failing the call.
async fn export_dataset(
    ctx: &ToolContext,
    dataset: &Dataset,
    run_id: &str,
    module: &str,
    session_id: &str,
) -> ToolResult<String> {
    let local = ctx
        .export_dir
        .join(run_id)
        .join(format!("{module}_data.csv"));
    let local_path = match ctx.publisher.save_output(dataset, &local.display().to_string()).await {
        Ok(path) => path,
        Err(_) => return Ok(String::new()),
    };
    if ctx.publisher.is_enabled() {
        let url = ctx
            .publisher
            .upload_artifact(std::path::Path::new(&local_path), run_id, module, Some(session_id))
            .await;
        if !url.is_empty() {
            return Ok(url);
        }
    }
    Ok(local_path)
}

/// Best-effort history append; a ledger failure is logged, never raised.
async fn append_history(
    ctx: &ToolContext,
    module: &str,
    status: &str,
    run_id: &str,
    session_id: &str,
    summary: &Value,
) {
    let entry = json!({
        "module": module,
        "status": status,
        "session_id": session_id,
        "summary": summary,
    });
    if let Err(e) = ctx.history.append(run_id, Some(session_id), entry).await {
        tracing::warn!(run_id, session_id, error = %e, "History append failed");
    }
}

fn profile_columns(dataset: &Dataset) -> Value {
    let mut profile = Map::new();
    for name in &dataset.columns {
        let values = dataset.column(name).unwrap_or_default();
        let nulls = values.iter().filter(|v| v.is_null()).count();
        let distinct = {
            let mut seen: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            seen.sort();
            seen.dedup();
            seen.len()
        };
        let numeric: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
        let mut col = Map::new();
        col.insert("nulls".to_string(), json!(nulls));
        col.insert("distinct".to_string(), json!(distinct));
        if !numeric.is_empty() {
            let min = numeric.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = numeric.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mean = numeric.iter().sum::<f64>() / numeric.len() as f64;
            col.insert("min".to_string(), json!(min));
            col.insert("max".to_string(), json!(max));
            col.insert("mean".to_string(), json!(mean));
        }
        profile.insert(name.clone(), Value::Object(col));
    }
    Value::Object(profile)
}

fn run_checks(dataset: &Dataset, config: &Map<String, Value>) -> ToolResult<Vec<Value>> {
    let mut checks = Vec::new();

    if let Some(required) = config.get("required_columns") {
        let required = required.as_array().ok_or_else(|| ToolError::Validation {
            field: "config.required_columns".to_string(),
            reason: "must be an array of column names".to_string(),
        })?;
        for column in required {
            let Some(column) = column.as_str() else {
                return Err(ToolError::Validation {
                    field: "config.required_columns".to_string(),
                    reason: "must contain only strings".to_string(),
                });
            };
            let present = dataset.columns.iter().any(|c| c == column);
            checks.push(json!({
                "check": "required_column",
                "column": column,
                "ok": present,
                "detail": if present { "present" } else { "missing" },
            }));
        }
    }

    if let Some(ranges) = config.get("ranges") {
        let ranges = ranges.as_object().ok_or_else(|| ToolError::Validation {
            field: "config.ranges".to_string(),
            reason: "must be an object of {column: {min, max}}".to_string(),
        })?;
        for (column, bounds) in ranges {
            let min = bounds.get("min").and_then(|v| v.as_f64());
            let max = bounds.get("max").and_then(|v| v.as_f64());
            let Some(values) = dataset.column(column) else {
                checks.push(json!({
                    "check": "range",
                    "column": column,
                    "ok": false,
                    "detail": "column missing",
                }));
                continue;
            };
            let violations = values
                .iter()
                .filter_map(|v| v.as_f64())
                .filter(|v| min.is_some_and(|m| *v < m) || max.is_some_and(|m| *v > m))
                .count();
            checks.push(json!({
                "check": "range",
                "column": column,
                "ok": violations == 0,
                "detail": format!("{violations} out-of-range values"),
            }));
        }
    }

    Ok(checks)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_context;
    use super::*;

    fn rows() -> Value {
        json!([
            {"id": 1, "score": 0.4, "name": "alice"},
            {"id": 2, "score": 1.8, "name": "bob"},
            {"id": 3, "score": null, "name": "bob"}
        ])
    }

    #[tokio::test]
    async fn test_diagnostics_profiles_and_saves_session() {
        let (ctx, _dir) = temp_context().await;
        let result = DiagnosticsTool
            .call(&ctx, json!({"rows": rows(), "export": false}))
            .await
            .unwrap();

        assert_eq!(result["status"], "pass");
        assert_eq!(result["module"], "diagnostics");
        let run_id = result["run_id"].as_str().unwrap();
        assert!(run_id.starts_with("run_"));

        let cols = &result["summary"]["columns"];
        assert_eq!(cols["score"]["nulls"], 1);
        assert_eq!(cols["name"]["distinct"], 2);
        assert_eq!(cols["id"]["min"], 1.0);
        assert_eq!(cols["id"]["max"], 3.0);
        assert_eq!(cols["id"]["mean"], 2.0);

        // Dataset is now addressable by session and bound to the run.
        let session_id = result["session_id"].as_str().unwrap();
        assert_eq!(ctx.sessions.get(session_id).unwrap().row_count(), 3);
        assert_eq!(ctx.sessions.bound_run_id(session_id).as_deref(), Some(run_id));

        // Outcome was appended to the (run, session) history.
        let (entries, meta) = ctx.history.read(run_id, Some(session_id)).await;
        assert!(meta.is_clean());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["module"], "diagnostics");
        assert_eq!(entries[0]["status"], "pass");
        assert_eq!(entries[0]["summary"]["dataset"]["_type"], "dataset");
    }

    #[tokio::test]
    async fn test_diagnostics_export_builds_contract() {
        let (ctx, dir) = temp_context().await;
        let result = DiagnosticsTool
            .call(&ctx, json!({"rows": rows(), "run_id": "run_exp"}))
            .await
            .unwrap();

        // Uploads are disabled, so the export lands locally and the
        // contract warns about the server-local path.
        let matrix = &result["artifacts"]["artifact_matrix"];
        assert_eq!(matrix["data_export"]["status"], "available");
        assert_eq!(matrix["data_export"]["reason"], "server_local_path");
        assert_eq!(result["status"], "pass");
        assert!(result["warnings"]
            .as_array()
            .unwrap()
            .iter()
            .any(|w| w.as_str().unwrap().contains("local to the server")));

        let export = dir.path().join("exports/run_exp/diagnostics_data.csv");
        assert!(export.exists());
    }

    #[tokio::test]
    async fn test_diagnostics_reuses_session_and_coerces_run_id() {
        let (ctx, _dir) = temp_context().await;
        let first = DiagnosticsTool
            .call(&ctx, json!({"rows": rows(), "run_id": "run_a", "export": false}))
            .await
            .unwrap();
        let session_id = first["session_id"].as_str().unwrap();

        let second = DiagnosticsTool
            .call(
                &ctx,
                json!({"session_id": session_id, "run_id": "run_b", "export": false}),
            )
            .await
            .unwrap();
        assert_eq!(second["run_id"], "run_a", "bound run id wins");
        assert!(second["warnings"]
            .as_array()
            .unwrap()
            .iter()
            .any(|w| w.as_str().unwrap().contains("run_b")));
    }

    #[tokio::test]
    async fn test_validation_pass_and_fail() {
        let (ctx, _dir) = temp_context().await;
        let passing = ValidationTool
            .call(
                &ctx,
                json!({
                    "rows": rows(),
                    "config": {
                        "required_columns": ["id", "name"],
                        "ranges": {"id": {"min": 0, "max": 10}}
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(passing["status"], "pass");
        assert_eq!(passing["summary"]["checks_failed"], 0);

        let failing = ValidationTool
            .call(
                &ctx,
                json!({
                    "rows": rows(),
                    "config": {
                        "required_columns": ["id", "missing_col"],
                        "ranges": {"score": {"min": 0.0, "max": 1.0}}
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(failing["status"], "fail");
        assert_eq!(failing["summary"]["checks_failed"], 2);
        let checks = failing["checks"].as_array().unwrap();
        assert!(checks.iter().any(|c| {
            c["check"] == "required_column" && c["column"] == "missing_col" && c["ok"] == false
        }));
        assert!(checks
            .iter()
            .any(|c| c["check"] == "range" && c["column"] == "score" && c["ok"] == false));
    }

    #[tokio::test]
    async fn test_validation_requires_config() {
        let (ctx, _dir) = temp_context().await;
        let err = ValidationTool
            .call(&ctx, json!({"rows": rows()}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_history_isolated_per_session() {
        let (ctx, _dir) = temp_context().await;
        let a = DiagnosticsTool
            .call(&ctx, json!({"rows": rows(), "run_id": "run_shared", "export": false}))
            .await
            .unwrap();
        let b = DiagnosticsTool
            .call(&ctx, json!({"rows": rows(), "run_id": "run_shared", "export": false}))
            .await
            .unwrap();
        let (sess_a, sess_b) = (
            a["session_id"].as_str().unwrap(),
            b["session_id"].as_str().unwrap(),
        );
        assert_ne!(sess_a, sess_b);

        let (entries_a, _) = ctx.history.read("run_shared", Some(sess_a)).await;
        let (entries_b, _) = ctx.history.read("run_shared", Some(sess_b)).await;
        assert_eq!(entries_a.len(), 1);
        assert_eq!(entries_b.len(), 1);
    }
}
