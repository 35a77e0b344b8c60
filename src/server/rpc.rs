//! JSON-RPC 2.0 request handling and method dispatch.
//!
//! Every request gets a trace id, exactly one metrics record, and one
//! structured log event. Failures are converted into the standard
//! `{code, message, data}` error shape with a structured envelope under
//! `data.error` so clients can branch on category/code/retryable instead of
//! scraping messages.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::error::{new_trace_id, ErrorEnvelope, RpcError, RpcResult};

use super::SharedState;

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// JSON-RPC version (must be "2.0").
    #[allow(dead_code)]
    pub jsonrpc: String,
    /// Request identifier (None for notifications).
    pub id: Option<Value>,
    /// The method name to invoke.
    pub method: String,
    /// Optional parameters for the method.
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request identifier (null when the request id was absent or unparseable).
    pub id: Value,
    /// The result on success (mutually exclusive with error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// The error on failure (mutually exclusive with result).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    /// Error code (negative for predefined errors).
    pub code: i32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional error data; `data.error` carries the envelope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Parameters for a tools/call request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    /// The name of the tool to invoke.
    pub name: String,
    /// Optional arguments for the tool.
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// Handle one raw request body.
///
/// Unparseable bodies produce a -32700 response rather than a transport
/// error, so every caller gets a JSON-RPC shaped answer.
pub async fn handle_raw(state: &SharedState, body: &str) -> JsonRpcResponse {
    let payload: Value = match serde_json::from_str(body) {
        Ok(payload) => payload,
        Err(e) => {
            return parse_error_response(
                state,
                RpcError::Parse {
                    message: e.to_string(),
                },
            )
        }
    };
    let request: JsonRpcRequest = match serde_json::from_value(payload) {
        Ok(request) => request,
        Err(e) => {
            return parse_error_response(
                state,
                RpcError::Parse {
                    message: format!("invalid JSON-RPC request: {e}"),
                },
            )
        }
    };
    handle_request(state, request).await
}

/// Dispatch one parsed request, recording metrics and a log event.
pub async fn handle_request(state: &SharedState, request: JsonRpcRequest) -> JsonRpcResponse {
    let start = Instant::now();
    let trace_id = new_trace_id();
    let id = request.id.clone().unwrap_or(Value::Null);
    let method = request.method.clone();
    let params = request.params.unwrap_or(Value::Null);

    let (outcome, tool_name) = dispatch_method(state, &method, params, &trace_id).await;
    let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
    let ok = outcome.is_ok();
    state
        .metrics
        .record_rpc(&method, duration_ms, ok, tool_name.as_deref());

    match outcome {
        Ok(result) => {
            info!(
                method = %method,
                tool = tool_name.as_deref().unwrap_or(""),
                trace_id = %trace_id,
                duration_ms,
                run_id = result.get("run_id").and_then(|v| v.as_str()).unwrap_or(""),
                session_id = result.get("session_id").and_then(|v| v.as_str()).unwrap_or(""),
                "RPC request succeeded"
            );
            JsonRpcResponse::ok(id, result)
        }
        Err(err) => {
            let code = err.code();
            warn!(
                method = %method,
                trace_id = %trace_id,
                duration_ms,
                code,
                error = %err,
                "RPC request failed"
            );
            let envelope = envelope_for(&err, &trace_id, state);
            JsonRpcResponse::err(
                id,
                code,
                format!("{err} (trace_id={trace_id})"),
                Some(json!({"error": envelope})),
            )
        }
    }
}

fn parse_error_response(state: &SharedState, err: RpcError) -> JsonRpcResponse {
    let trace_id = new_trace_id();
    state.metrics.record_rpc("parse", 0.0, false, None);
    warn!(trace_id = %trace_id, error = %err, "Rejected unparseable RPC request");
    let envelope = envelope_for(&err, &trace_id, state);
    JsonRpcResponse::err(
        Value::Null,
        err.code(),
        format!("{err} (trace_id={trace_id})"),
        Some(json!({"error": envelope})),
    )
}

/// Route a method to its handler. The returned tool name is set only for
/// registered tools so unknown names never reach the per-tool metrics.
async fn dispatch_method(
    state: &SharedState,
    method: &str,
    params: Value,
    trace_id: &str,
) -> (RpcResult<Value>, Option<String>) {
    match method {
        "initialize" => (Ok(initialize_result(state)), None),

        "tools/list" => (
            Ok(json!({"tools": state.tools.descriptors()})),
            None,
        ),

        "tools/call" => {
            let params: ToolCallParams = match serde_json::from_value(params) {
                Ok(params) => params,
                Err(e) => {
                    return (
                        Err(RpcError::InvalidParams {
                            message: format!("tools/call requires {{name, arguments}}: {e}"),
                        }),
                        None,
                    )
                }
            };
            if !state.tools.contains(&params.name) {
                return (
                    Err(RpcError::UnknownTool {
                        tool_name: params.name,
                    }),
                    None,
                );
            }
            let args = params.arguments.unwrap_or(Value::Null);
            let result = state
                .tools
                .call(&state.ctx, &params.name, args, trace_id)
                .await
                .map(|r| attach_trace_id(r, trace_id));
            (result, Some(params.name))
        }

        "resources/list" => {
            let timeout = resource_timeout(state);
            let result = match tokio::time::timeout(timeout, state.resources.list()).await {
                Ok(Ok(resources)) => Ok(json!({"resources": resources})),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(RpcError::Timeout {
                    operation: "resources/list".to_string(),
                    timeout_sec: state.config.resources.io_timeout_sec,
                }),
            };
            (result, None)
        }

        "resources/templates/list" => (
            Ok(json!({"resourceTemplates": state.resources.templates()})),
            None,
        ),

        "resources/read" => {
            let Some(uri) = params
                .get("uri")
                .and_then(|u| u.as_str())
                .filter(|u| !u.is_empty())
            else {
                return (
                    Err(RpcError::InvalidParams {
                        message: "resources/read requires a non-empty string 'uri'".to_string(),
                    }),
                    None,
                );
            };
            let timeout = resource_timeout(state);
            let result = match tokio::time::timeout(timeout, state.resources.read(uri)).await {
                Ok(Ok(text)) => Ok(json!({
                    "contents": [{
                        "uri": uri,
                        "mimeType": state.resources.mime_type(),
                        "text": text,
                    }]
                })),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(RpcError::Timeout {
                    operation: "resources/read".to_string(),
                    timeout_sec: state.config.resources.io_timeout_sec,
                }),
            };
            (result, None)
        }

        other => (
            Err(RpcError::UnknownMethod {
                method: other.to_string(),
            }),
            None,
        ),
    }
}

fn initialize_result(state: &SharedState) -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {
            "tools": {"listChanged": false},
            "resources": {"listChanged": false},
        },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
        "instructions": format!(
            "Data-processing control plane exposing {} tools over JSON-RPC.",
            state.tools.len()
        ),
    })
}

fn resource_timeout(state: &SharedState) -> Duration {
    Duration::from_secs(state.config.resources.io_timeout_sec.max(1))
}

/// Stamp the correlation id onto object results.
fn attach_trace_id(mut result: Value, trace_id: &str) -> Value {
    if let Some(obj) = result.as_object_mut() {
        obj.entry("trace_id")
            .or_insert_with(|| Value::String(trace_id.to_string()));
    }
    result
}

/// Structured envelope describing an RPC failure for `error.data.error`.
fn envelope_for(err: &RpcError, trace_id: &str, state: &SharedState) -> ErrorEnvelope {
    let timeout_hint = format!(
        "Increase ANALYST_MCP_RESOURCE_TIMEOUT_SEC (current={}s) and retry.",
        state.config.resources.io_timeout_sec
    );
    match err {
        RpcError::Parse { .. } => ErrorEnvelope::new(
            "transport",
            "rpc_parse_error",
            err.to_string(),
            "Send a valid JSON-RPC 2.0 request body.",
            false,
            trace_id,
        ),
        RpcError::UnknownMethod { .. } => ErrorEnvelope::new(
            "config",
            "method_not_found",
            err.to_string(),
            "Use one of: initialize, tools/list, tools/call, resources/list, \
             resources/templates/list, resources/read.",
            false,
            trace_id,
        ),
        RpcError::UnknownTool { .. } => ErrorEnvelope::new(
            "config",
            "tool_not_found",
            err.to_string(),
            "Call tools/list and retry with a registered tool name.",
            false,
            trace_id,
        ),
        RpcError::InvalidParams { .. } => ErrorEnvelope::new(
            "validation",
            "invalid_params",
            err.to_string(),
            "Fix the request parameters against the tool's inputSchema.",
            false,
            trace_id,
        ),
        RpcError::ResourceNotFound { uri } => ErrorEnvelope::new(
            "io",
            "resource_not_found",
            format!("Template resource not found for URI: {uri}"),
            "Refresh resources/list and retry with an existing URI.",
            false,
            trace_id,
        ),
        RpcError::Timeout { operation, .. } => ErrorEnvelope::new(
            "transport",
            if operation == "resources/read" {
                "resource_read_timeout"
            } else {
                "resources_list_timeout"
            },
            err.to_string(),
            timeout_hint,
            true,
            trace_id,
        ),
        RpcError::Internal { .. } => ErrorEnvelope::new(
            "internal",
            "rpc_internal_error",
            err.to_string(),
            "Retry once for transient failures. If it continues, inspect server \
             logs with trace_id.",
            false,
            trace_id,
        ),
    }
}
