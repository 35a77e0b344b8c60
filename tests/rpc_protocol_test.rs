//! End-to-end JSON-RPC protocol tests through the HTTP router.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tower::ServiceExt;

use mcp_analyst_toolkit::config::{
    ArtifactConfig, Config, LogFormat, LoggingConfig, ResourceConfig, ServerConfig, SessionConfig,
    StorageConfig,
};
use mcp_analyst_toolkit::server::{http::create_router, AppState, SharedState};

fn test_config(root: &std::path::Path, auth_token: &str) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8001,
            auth_token: auth_token.to_string(),
        },
        sessions: SessionConfig::default(),
        storage: StorageConfig {
            job_state_path: root.join("jobs/job_state.json"),
            history_dir: root.join("history"),
            export_dir: root.join("exports"),
        },
        artifacts: ArtifactConfig {
            bucket: String::new(),
            ..Default::default()
        },
        resources: ResourceConfig {
            template_dir: root.join("templates"),
            ..Default::default()
        },
        logging: LoggingConfig {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        },
    }
}

async fn test_state(auth_token: &str) -> (SharedState, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    tokio::fs::create_dir_all(dir.path().join("templates"))
        .await
        .unwrap();
    tokio::fs::write(
        dir.path().join("templates/fraud_detection.yaml"),
        "validation:\n  required_columns: [transaction_id]\n",
    )
    .await
    .unwrap();
    let state = AppState::from_config(test_config(dir.path(), auth_token))
        .await
        .unwrap();
    (Arc::new(state), dir)
}

fn rpc_request(payload: &Value, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn rpc(state: &SharedState, payload: Value) -> Value {
    let response = create_router(Arc::clone(state))
        .oneshot(rpc_request(&payload, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

#[tokio::test]
async fn test_initialize_handshake() {
    let (state, _dir) = test_state("").await;
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}}),
    )
    .await;
    assert_eq!(body["jsonrpc"], "2.0");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["protocolVersion"], "2024-11-05");
    assert_eq!(body["result"]["capabilities"]["tools"]["listChanged"], false);
}

#[tokio::test]
async fn test_tools_list_advertises_toolkit() {
    let (state, _dir) = test_state("").await;
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}),
    )
    .await;
    let names: Vec<&str> = body["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"toolkit_diagnostics"));
    assert!(names.contains(&"toolkit_validation"));
    assert!(names.contains(&"toolkit_job_status"));
}

#[tokio::test]
async fn test_tools_call_diagnostics_full_flow() {
    let (state, _dir) = test_state("").await;
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {
            "name": "toolkit_diagnostics",
            "arguments": {
                "rows": [{"id": 1, "score": 0.5}, {"id": 2, "score": null}],
                "run_id": "run_e2e",
                "export": false
            }
        }}),
    )
    .await;
    let result = &body["result"];
    assert_eq!(result["status"], "pass");
    assert_eq!(result["run_id"], "run_e2e");
    assert_eq!(result["summary"]["columns"]["score"]["nulls"], 1);
    let session_id = result["session_id"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("sess_"));

    // The outcome is visible through the history tool, same run/session.
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 4, "method": "tools/call", "params": {
            "name": "toolkit_history",
            "arguments": {"run_id": "run_e2e", "session_id": session_id}
        }}),
    )
    .await;
    let entries = body["result"]["entries"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["module"], "diagnostics");
    assert_eq!(body["result"]["skipped_records"], 0);
}

#[tokio::test]
async fn test_async_tool_call_and_job_polling() {
    let (state, _dir) = test_state("").await;
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 5, "method": "tools/call", "params": {
            "name": "toolkit_validation",
            "arguments": {
                "rows": [{"amount": 10.0}],
                "config": {"required_columns": ["amount"]},
                "run_async": true
            }
        }}),
    )
    .await;
    let job_id = body["result"]["job_id"].as_str().unwrap().to_string();
    assert_eq!(body["result"]["state"], "queued");

    // Poll until the spawned task finishes.
    let mut job = Value::Null;
    for _ in 0..100 {
        let body = rpc(
            &state,
            json!({"jsonrpc": "2.0", "id": 6, "method": "tools/call", "params": {
                "name": "toolkit_job_status",
                "arguments": {"job_id": job_id}
            }}),
        )
        .await;
        job = body["result"]["job"].clone();
        if job["state"] == "succeeded" || job["state"] == "failed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(job["state"], "succeeded");
    assert_eq!(job["result"]["status"], "pass");
    assert_eq!(job["module"], "toolkit_validation");
}

#[tokio::test]
async fn test_unknown_tool_code_and_no_by_tool_metric() {
    let (state, _dir) = test_state("").await;
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 7, "method": "tools/call", "params": {
            "name": "toolkit_nope", "arguments": {}
        }}),
    )
    .await;
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["error"]["data"]["error"]["code"], "tool_not_found");

    let response = create_router(Arc::clone(&state))
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let metrics = body_json(response).await;
    assert_eq!(metrics["rpc"]["errors_total"], 1);
    assert!(metrics["rpc"]["by_tool"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn test_malformed_body_is_parse_error_not_http_400() {
    let (state, _dir) = test_state("").await;
    let request = Request::builder()
        .method("POST")
        .uri("/rpc")
        .header("content-type", "application/json")
        .body(Body::from("{broken"))
        .unwrap();
    let response = create_router(state).oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn test_resources_list_and_read_over_http() {
    let (state, _dir) = test_state("").await;
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 8, "method": "resources/list", "params": {}}),
    )
    .await;
    let uris: Vec<&str> = body["result"]["resources"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["uri"].as_str().unwrap())
        .collect();
    assert_eq!(uris, vec!["analyst://templates/fraud_detection.yaml"]);

    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 9, "method": "resources/read", "params": {
            "uri": "analyst://templates/fraud_detection.yaml"
        }}),
    )
    .await;
    let contents = &body["result"]["contents"][0];
    assert_eq!(contents["mimeType"], "application/x-yaml");
    assert!(contents["text"].as_str().unwrap().contains("transaction_id"));

    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 10, "method": "resources/templates/list", "params": {}}),
    )
    .await;
    assert_eq!(body["result"]["resourceTemplates"], json!([]));
}

#[tokio::test]
async fn test_auth_rejects_without_token() {
    let (state, _dir) = test_state("hunter2").await;
    let payload = json!({"jsonrpc": "2.0", "id": 11, "method": "tools/list", "params": {}});

    let response = create_router(Arc::clone(&state))
        .oneshot(rpc_request(&payload, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = create_router(Arc::clone(&state))
        .oneshot(rpc_request(&payload, Some("wrong")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Rejected requests never reach dispatch or metrics.
    let response = create_router(Arc::clone(&state))
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .header("authorization", "Bearer hunter2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let metrics = body_json(response).await;
    assert_eq!(metrics["rpc"]["requests_total"], 0);

    let response = create_router(state)
        .oneshot(rpc_request(&payload, Some("hunter2")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_probes_bypass_auth() {
    let (state, _dir) = test_state("hunter2").await;
    for path in ["/health", "/ready"] {
        let response = create_router(Arc::clone(&state))
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{path} must bypass auth");
    }
    // Metrics stay behind auth.
    let response = create_router(state)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_health_shape() {
    let (state, _dir) = test_state("").await;
    let response = create_router(Arc::clone(&state))
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["tools"], state.tools.len());
    assert!(body["version"].is_string());
    assert!(body["uptime_sec"].is_u64());

    let response = create_router(state)
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(body_json(response).await["status"], "ready");
}

#[tokio::test]
async fn test_jobs_survive_state_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path(), "");

    let job_id = {
        let state = Arc::new(AppState::from_config(config.clone()).await.unwrap());
        let body = rpc(
            &state,
            json!({"jsonrpc": "2.0", "id": 12, "method": "tools/call", "params": {
                "name": "toolkit_diagnostics",
                "arguments": {"rows": [{"a": 1}], "export": false, "run_async": true}
            }}),
        )
        .await;
        let job_id = body["result"]["job_id"].as_str().unwrap().to_string();
        // Wait for the terminal state so the persisted table has the result.
        for _ in 0..100 {
            if state
                .ctx
                .jobs
                .get(&job_id)
                .is_some_and(|j| j.state.is_terminal())
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        job_id
    };

    // Simulated restart: fresh state over the same storage paths.
    let state = Arc::new(AppState::from_config(config).await.unwrap());
    let body = rpc(
        &state,
        json!({"jsonrpc": "2.0", "id": 13, "method": "tools/call", "params": {
            "name": "toolkit_job_status",
            "arguments": {"job_id": job_id}
        }}),
    )
    .await;
    assert_eq!(body["result"]["job"]["state"], "succeeded");
}
