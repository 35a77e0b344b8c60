//! Operational tools: history readback, session admin, and job polling.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{ToolError, ToolResult};
use crate::jobs::JobState;

use super::{opt_str, req_str, ToolContext, ToolDescriptor, ToolHandler};

/// Read back the (run, session) history ledger.
pub struct HistoryTool;

#[async_trait]
impl ToolHandler for HistoryTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_history".to_string(),
            description: "Read the append-only history of tool outcomes for a run, \
                          optionally scoped to one session. Degraded reads surface \
                          parse_errors and skipped_records instead of failing."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "run_id": {"type": "string"},
                    "session_id": {"type": "string"}
                },
                "required": ["run_id"]
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
        let run_id = req_str(&args, "run_id")?;
        let session_id = opt_str(&args, "session_id");
        let (entries, meta) = ctx.history.read(&run_id, session_id.as_deref()).await;

        let mut warnings: Vec<String> = meta.parse_errors.clone();
        if meta.skipped_records > 0 {
            warnings.push(format!(
                "{} history record(s) could not be recovered and were skipped",
                meta.skipped_records
            ));
        }

        let mut outcome = json!({
            "status": if meta.is_clean() { "pass" } else { "warn" },
            "module": "history",
            "run_id": run_id,
            "entries": entries,
            "parse_errors": meta.parse_errors,
            "skipped_records": meta.skipped_records,
        });
        if let Some(session_id) = session_id {
            outcome["session_id"] = json!(session_id);
        }
        if !warnings.is_empty() {
            outcome["warnings"] = json!(warnings);
        }
        Ok(outcome)
    }
}

/// List live sessions with shape metadata.
pub struct SessionListTool;

#[async_trait]
impl ToolHandler for SessionListTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_session_list".to_string(),
            description: "List live dataset sessions with row/column counts.".to_string(),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(&self, ctx: &ToolContext, _args: Value) -> ToolResult<Value> {
        let sessions = ctx.sessions.list_sessions();
        Ok(json!({
            "status": "pass",
            "module": "session_list",
            "count": sessions.len(),
            "sessions": sessions,
        }))
    }
}

/// Drop one session, or all of them.
pub struct SessionClearTool;

#[async_trait]
impl ToolHandler for SessionClearTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_session_clear".to_string(),
            description: "Clear one dataset session by id, or all sessions when no id \
                          is given."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "session_id": {"type": "string"}
                }
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
        let session_id = opt_str(&args, "session_id");
        let cleared = ctx.sessions.clear(session_id.as_deref());
        Ok(json!({
            "status": "pass",
            "module": "session_clear",
            "cleared": cleared,
            "remaining": ctx.sessions.len(),
        }))
    }
}

/// Poll one job by id.
pub struct JobStatusTool;

#[async_trait]
impl ToolHandler for JobStatusTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_job_status".to_string(),
            description: "Fetch the state and, once finished, the result or error of \
                          one asynchronous job."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "job_id": {"type": "string"}
                },
                "required": ["job_id"]
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
        let job_id = req_str(&args, "job_id")?;
        let job = ctx.jobs.get(&job_id).ok_or_else(|| ToolError::Validation {
            field: "job_id".to_string(),
            reason: format!("unknown job id: {job_id}"),
        })?;
        Ok(json!({
            "status": "pass",
            "module": "job_status",
            "job": job,
        }))
    }
}

/// List recent jobs, optionally filtered by state.
pub struct JobsListTool;

#[async_trait]
impl ToolHandler for JobsListTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "toolkit_jobs_list".to_string(),
            description: "List tracked jobs, most recently updated first, optionally \
                          filtered by state (queued, running, succeeded, failed)."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "limit": {"type": "integer", "default": 20},
                    "state": {
                        "type": "string",
                        "enum": ["queued", "running", "succeeded", "failed"]
                    }
                }
            }),
        }
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value> {
        let limit = args
            .get("limit")
            .and_then(|v| v.as_u64())
            .unwrap_or(20) as usize;
        let state = match opt_str(&args, "state") {
            Some(raw) => Some(raw.parse::<JobState>().map_err(|reason| {
                ToolError::Validation {
                    field: "state".to_string(),
                    reason,
                }
            })?),
            None => None,
        };

        let jobs = ctx.jobs.list(limit, state);
        Ok(json!({
            "status": "pass",
            "module": "jobs_list",
            "count": jobs.len(),
            "jobs": jobs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::temp_context;
    use super::*;

    #[tokio::test]
    async fn test_history_tool_surfaces_degraded_reads() {
        let (ctx, _dir) = temp_context().await;
        ctx.history
            .append("run_1", None, json!({"module": "m", "status": "pass"}))
            .await
            .unwrap();
        // Corrupt the file in place.
        let path = ctx.history.path_for("run_1", None);
        let mut text = tokio::fs::read_to_string(&path).await.unwrap();
        text.push_str("garbage");
        tokio::fs::write(&path, text).await.unwrap();

        let result = HistoryTool
            .call(&ctx, json!({"run_id": "run_1"}))
            .await
            .unwrap();
        assert_eq!(result["status"], "warn");
        assert_eq!(result["entries"].as_array().unwrap().len(), 1);
        assert!(result["skipped_records"].as_u64().unwrap() >= 1);
        assert!(!result["parse_errors"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_tool_empty_run_is_clean_pass() {
        let (ctx, _dir) = temp_context().await;
        let result = HistoryTool
            .call(&ctx, json!({"run_id": "run_empty"}))
            .await
            .unwrap();
        assert_eq!(result["status"], "pass");
        assert!(result["entries"].as_array().unwrap().is_empty());
        assert_eq!(result["skipped_records"], 0);
    }

    #[tokio::test]
    async fn test_session_list_and_clear() {
        let (ctx, _dir) = temp_context().await;
        let ds = crate::dataset::Dataset::from_records(&[json!({"a": 1})]).unwrap();
        let keep = ctx.sessions.save(ds.clone(), None, None).unwrap();
        let drop = ctx.sessions.save(ds, None, None).unwrap();

        let listed = SessionListTool.call(&ctx, json!({})).await.unwrap();
        assert_eq!(listed["count"], 2);
        assert!(listed["sessions"].get(&keep).is_some());

        let cleared = SessionClearTool
            .call(&ctx, json!({"session_id": drop}))
            .await
            .unwrap();
        assert_eq!(cleared["cleared"], 1);
        assert_eq!(cleared["remaining"], 1);

        let cleared_all = SessionClearTool.call(&ctx, json!({})).await.unwrap();
        assert_eq!(cleared_all["cleared"], 1);
        assert_eq!(cleared_all["remaining"], 0);
    }

    #[tokio::test]
    async fn test_job_status_round_trip() {
        let (ctx, _dir) = temp_context().await;
        let job_id = ctx.jobs.create("diagnostics", None, None).await.unwrap();
        ctx.jobs.mark_running(&job_id).await.unwrap();

        let result = JobStatusTool
            .call(&ctx, json!({"job_id": job_id}))
            .await
            .unwrap();
        assert_eq!(result["job"]["state"], "running");
        assert_eq!(result["job"]["module"], "diagnostics");

        let err = JobStatusTool
            .call(&ctx, json!({"job_id": "job_unknown"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_jobs_list_filters_by_state() {
        let (ctx, _dir) = temp_context().await;
        let a = ctx.jobs.create("m", None, None).await.unwrap();
        let _b = ctx.jobs.create("m", None, None).await.unwrap();
        ctx.jobs.mark_running(&a).await.unwrap();
        ctx.jobs.mark_succeeded(&a, None).await.unwrap();

        let all = JobsListTool.call(&ctx, json!({})).await.unwrap();
        assert_eq!(all["count"], 2);

        let done = JobsListTool
            .call(&ctx, json!({"state": "succeeded"}))
            .await
            .unwrap();
        assert_eq!(done["count"], 1);
        assert_eq!(done["jobs"][0]["job_id"], a);

        let err = JobsListTool
            .call(&ctx, json!({"state": "bogus"}))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { .. }));
    }
}
