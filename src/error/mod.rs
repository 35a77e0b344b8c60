use serde::Serialize;
use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// State-layer errors (sessions, jobs, history)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Session {session_id} is bound to run {bound}, rejected run {requested}")]
    RunIdMismatch {
        session_id: String,
        bound: String,
        requested: String,
    },

    #[error("Persistence failed: {message}")]
    Persistence { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by tool handlers
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Validation failed: {field} - {reason}")]
    Validation { field: String, reason: String },

    #[error("Session error: {0}")]
    Session(String),

    #[error("Execution failed: {message}")]
    Execution { message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// RPC dispatch errors, each mapping to a JSON-RPC error code
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Method not found: {method}")]
    UnknownMethod { method: String },

    #[error("Tool not found: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Resource not found: {uri}")]
    ResourceNotFound { uri: String },

    #[error("{operation} timed out after {timeout_sec}s")]
    Timeout { operation: String, timeout_sec: u64 },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// JSON-RPC 2.0 error codes used by the dispatcher.
pub mod rpc_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const SERVER_TIMEOUT: i32 = -32000;
}

impl RpcError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Parse { .. } => rpc_codes::PARSE_ERROR,
            RpcError::UnknownMethod { .. } | RpcError::UnknownTool { .. } => {
                rpc_codes::METHOD_NOT_FOUND
            }
            RpcError::InvalidParams { .. } | RpcError::ResourceNotFound { .. } => {
                rpc_codes::INVALID_PARAMS
            }
            RpcError::Timeout { .. } => rpc_codes::SERVER_TIMEOUT,
            RpcError::Internal { .. } => rpc_codes::INTERNAL_ERROR,
        }
    }
}

impl From<ToolError> for RpcError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Validation { field, reason } => RpcError::InvalidParams {
                message: format!("{field}: {reason}"),
            },
            other => RpcError::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Machine- and human-readable error payload carried in `error.data.error`
/// of JSON-RPC responses and in failed tool outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    /// Error category: "internal", "transport", "io", "config", "validation".
    pub category: String,
    /// Stable machine-readable code, e.g. "rpc_tools_call_internal_error".
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Suggested next step for the caller.
    pub remediation: String,
    /// Whether a retry may succeed without operator intervention.
    pub retryable: bool,
    /// Correlation id shared with server logs.
    pub trace_id: String,
    /// Optional structured details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorEnvelope {
    pub fn new(
        category: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        remediation: impl Into<String>,
        retryable: bool,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            category: category.into(),
            code: code.into(),
            message: message.into(),
            remediation: remediation.into(),
            retryable,
            trace_id: trace_id.into(),
            details: None,
        }
    }
}

/// Generate a short correlation id for request/response tracing.
pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for state-layer operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type alias for tool handlers
pub type ToolResult<T> = Result<T, ToolError>;

/// Result type alias for RPC dispatch
pub type RpcResult<T> = Result<T, RpcError>;
