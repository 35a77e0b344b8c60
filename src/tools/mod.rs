//! Tool registry and shared tool plumbing.
//!
//! Tools are the pluggable units of work behind `tools/call`. The registry
//! is an explicitly constructed, dependency-injected object owned by the
//! server state, so tests can build isolated registries and multiple server
//! instances can coexist in one process.
//!
//! Every tool is an async callable from named JSON arguments to an open
//! result record. Well-known fields (`status`, `module`, `run_id`,
//! `session_id`, `summary`) are read generically by the dispatcher and the
//! history layer; everything else is tool-specific extension data.

pub mod admin;
pub mod analysis;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::error;

use crate::artifacts::ArtifactPublisher;
use crate::config::Config;
use crate::error::{ErrorEnvelope, RpcError, RpcResult, ToolError, ToolResult};
use crate::history::HistoryLedger;
use crate::jobs::JobStore;
use crate::session::SessionStore;

/// Shared state handed to every tool invocation.
pub struct ToolContext {
    pub sessions: Arc<SessionStore>,
    pub jobs: Arc<JobStore>,
    pub history: Arc<HistoryLedger>,
    pub publisher: Arc<ArtifactPublisher>,
    /// Root for local data exports.
    pub export_dir: PathBuf,
}

impl ToolContext {
    pub fn new(
        config: &Config,
        sessions: Arc<SessionStore>,
        jobs: Arc<JobStore>,
        history: Arc<HistoryLedger>,
        publisher: Arc<ArtifactPublisher>,
    ) -> Self {
        Self {
            sessions,
            jobs,
            history,
            publisher,
            export_dir: config.storage.export_dir.clone(),
        }
    }
}

/// Static tool metadata advertised by `tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// One registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// Whether the tool may run under a job via `run_async: true`.
    fn supports_async(&self) -> bool {
        false
    }

    async fn call(&self, ctx: &ToolContext, args: Value) -> ToolResult<Value>;
}

/// Name-keyed tool catalog.
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    /// Registry with the full built-in toolkit.
    pub fn with_builtin_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(analysis::DiagnosticsTool));
        registry.register(Arc::new(analysis::ValidationTool));
        registry.register(Arc::new(admin::HistoryTool));
        registry.register(Arc::new(admin::SessionListTool));
        registry.register(Arc::new(admin::SessionClearTool));
        registry.register(Arc::new(admin::JobStatusTool));
        registry.register(Arc::new(admin::JobsListTool));
        registry
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        self.tools.insert(tool.descriptor().name, tool);
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| t.descriptor()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Invoke a tool by name.
    ///
    /// Argument validation surfaces as an invalid-params RPC error; any
    /// other tool failure is folded into an error-status result record so a
    /// pipeline sees a structured outcome instead of a dropped call. With
    /// `run_async: true` on a supporting tool, the call returns
    /// `{job_id, state: "queued"}` immediately and the work proceeds under
    /// a spawned task with job-store transitions.
    pub async fn call(
        &self,
        ctx: &Arc<ToolContext>,
        name: &str,
        mut args: Value,
        trace_id: &str,
    ) -> RpcResult<Value> {
        let tool = self
            .tools
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownTool {
                tool_name: name.to_string(),
            })?;

        if !args.is_object() && !args.is_null() {
            return Err(RpcError::InvalidParams {
                message: "tool arguments must be a JSON object".to_string(),
            });
        }
        if args.is_null() {
            args = Value::Object(Map::new());
        }

        let run_async = args
            .as_object_mut()
            .and_then(|o| o.remove("run_async"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if run_async && tool.supports_async() {
            return self.spawn_job(ctx, tool, name, args).await;
        }

        match tool.call(ctx, args).await {
            Ok(result) => Ok(result),
            Err(ToolError::Validation { field, reason }) => Err(RpcError::InvalidParams {
                message: format!("{field}: {reason}"),
            }),
            Err(err) => {
                error!(tool = name, error = %err, trace_id, "Tool execution failed");
                Ok(error_outcome(name, &err, trace_id))
            }
        }
    }

    async fn spawn_job(
        &self,
        ctx: &Arc<ToolContext>,
        tool: Arc<dyn ToolHandler>,
        name: &str,
        args: Value,
    ) -> RpcResult<Value> {
        let run_id = opt_str(&args, "run_id");
        let job_id = ctx
            .jobs
            .create(name, run_id.as_deref(), Some(args.clone()))
            .await
            .map_err(|e| RpcError::Internal {
                message: format!("failed to enqueue job: {e}"),
            })?;

        let ctx = Arc::clone(ctx);
        let job_id_task = job_id.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = ctx.jobs.mark_running(&job_id_task).await {
                error!(job_id = %job_id_task, error = %e, "Failed to mark job running");
            }
            match tool.call(&ctx, args).await {
                Ok(result) => {
                    if let Err(e) = ctx.jobs.mark_succeeded(&job_id_task, Some(result)).await {
                        error!(job_id = %job_id_task, error = %e, "Failed to persist job success");
                    }
                }
                Err(err) => {
                    let payload = json!({"message": err.to_string(), "module": name});
                    if let Err(e) = ctx.jobs.mark_failed(&job_id_task, payload).await {
                        error!(job_id = %job_id_task, error = %e, "Failed to persist job failure");
                    }
                }
            }
        });

        Ok(json!({"job_id": job_id, "state": "queued"}))
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::with_builtin_tools()
    }
}

/// Error-status result record returned when a tool fails at runtime.
fn error_outcome(name: &str, err: &ToolError, trace_id: &str) -> Value {
    let envelope = ErrorEnvelope::new(
        "internal",
        "tool_execution_failed",
        err.to_string(),
        "Verify tool arguments and environment prerequisites. \
         If the issue persists, inspect server logs using trace_id.",
        false,
        trace_id,
    );
    json!({
        "status": "error",
        "module": name,
        "error": envelope,
        "trace_id": trace_id,
    })
}

// Argument extraction helpers shared by the tool handlers.

pub(crate) fn opt_str(args: &Value, key: &str) -> Option<String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn req_str(args: &Value, key: &str) -> ToolResult<String> {
    opt_str(args, key).ok_or_else(|| ToolError::Validation {
        field: key.to_string(),
        reason: "required non-empty string".to_string(),
    })
}

pub(crate) fn opt_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
}

/// Run id for a new pipeline step when the caller did not supply one.
pub(crate) fn new_run_id() -> String {
    format!("run_{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
}

/// Load the dataset a tool should operate on: inline `rows` win over a
/// saved `session_id`, which wins over a local `path`.
pub(crate) async fn load_dataset(
    ctx: &ToolContext,
    args: &Value,
) -> ToolResult<crate::dataset::Dataset> {
    if let Some(rows) = args.get("rows") {
        let records = rows.as_array().ok_or_else(|| ToolError::Validation {
            field: "rows".to_string(),
            reason: "must be an array of JSON objects".to_string(),
        })?;
        if records.is_empty() {
            return Err(ToolError::Validation {
                field: "rows".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        return crate::dataset::Dataset::from_records(records);
    }

    if let Some(session_id) = opt_str(args, "session_id") {
        return ctx.sessions.get(&session_id).ok_or_else(|| {
            ToolError::Session(format!("session not found or expired: {session_id}"))
        });
    }

    if let Some(path) = opt_str(args, "path") {
        return crate::dataset::Dataset::from_path(std::path::Path::new(&path)).await;
    }

    Err(ToolError::Validation {
        field: "rows".to_string(),
        reason: "provide one of 'rows', 'session_id', or 'path'".to_string(),
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::ArtifactConfig;
    use std::time::Duration;

    /// Context over temp storage with uploads disabled.
    pub async fn temp_context() -> (Arc<ToolContext>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ToolContext {
            sessions: Arc::new(SessionStore::new(Duration::from_secs(3600), false)),
            jobs: Arc::new(
                JobStore::open(dir.path().join("jobs/job_state.json"))
                    .await
                    .unwrap(),
            ),
            history: Arc::new(HistoryLedger::new(dir.path().join("history"))),
            publisher: Arc::new(ArtifactPublisher::new(&ArtifactConfig::default())),
            export_dir: dir.path().join("exports"),
        };
        (Arc::new(ctx), dir)
    }
}
