//! Runtime request metrics for the operability endpoints.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::{json, Value};

#[derive(Debug, Default)]
struct Counters {
    requests_total: u64,
    errors_total: u64,
    total_latency_ms: f64,
    by_method: HashMap<String, u64>,
    by_tool: HashMap<String, u64>,
}

/// Thread-safe RPC counters, dependency-injected into the dispatcher so
/// tests and multiple in-process servers each get their own instance.
pub struct RuntimeMetrics {
    started_at: Instant,
    counters: Mutex<Counters>,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            counters: Mutex::new(Counters::default()),
        }
    }

    /// Record one dispatched RPC request. `tool_name` is counted only when
    /// present, so unknown tool names never pollute `by_tool`.
    pub fn record_rpc(&self, method: &str, duration_ms: f64, ok: bool, tool_name: Option<&str>) {
        let mut c = self.counters.lock().expect("metrics lock poisoned");
        c.requests_total += 1;
        c.total_latency_ms += duration_ms.max(0.0);
        let method = if method.is_empty() { "unknown" } else { method };
        *c.by_method.entry(method.to_string()).or_insert(0) += 1;
        if let Some(tool) = tool_name.filter(|t| !t.is_empty()) {
            *c.by_tool.entry(tool.to_string()).or_insert(0) += 1;
        }
        if !ok {
            c.errors_total += 1;
        }
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Point-in-time metrics document served by `GET /metrics`.
    pub fn snapshot(&self) -> Value {
        let c = self.counters.lock().expect("metrics lock poisoned");
        let avg_latency_ms = if c.requests_total > 0 {
            (c.total_latency_ms / c.requests_total as f64 * 100.0).round() / 100.0
        } else {
            0.0
        };
        json!({
            "rpc": {
                "requests_total": c.requests_total,
                "errors_total": c.errors_total,
                "avg_latency_ms": avg_latency_ms,
                "by_method": c.by_method,
                "by_tool": c.by_tool,
            },
            "uptime_sec": self.uptime_sec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_starts_empty() {
        let metrics = RuntimeMetrics::new();
        let snap = metrics.snapshot();
        assert_eq!(snap["rpc"]["requests_total"], 0);
        assert_eq!(snap["rpc"]["errors_total"], 0);
        assert_eq!(snap["rpc"]["avg_latency_ms"], 0.0);
    }

    #[test]
    fn test_record_rpc_accumulates() {
        let metrics = RuntimeMetrics::new();
        metrics.record_rpc("tools/call", 10.0, true, Some("toolkit_diagnostics"));
        metrics.record_rpc("tools/call", 20.0, false, Some("toolkit_diagnostics"));
        metrics.record_rpc("tools/list", 3.0, true, None);

        let snap = metrics.snapshot();
        assert_eq!(snap["rpc"]["requests_total"], 3);
        assert_eq!(snap["rpc"]["errors_total"], 1);
        assert_eq!(snap["rpc"]["avg_latency_ms"], 11.0);
        assert_eq!(snap["rpc"]["by_method"]["tools/call"], 2);
        assert_eq!(snap["rpc"]["by_method"]["tools/list"], 1);
        assert_eq!(snap["rpc"]["by_tool"]["toolkit_diagnostics"], 2);
    }

    #[test]
    fn test_missing_tool_name_not_counted() {
        let metrics = RuntimeMetrics::new();
        metrics.record_rpc("tools/call", 5.0, false, None);
        let snap = metrics.snapshot();
        assert_eq!(snap["rpc"]["requests_total"], 1);
        assert!(snap["rpc"]["by_tool"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_empty_method_counted_as_unknown() {
        let metrics = RuntimeMetrics::new();
        metrics.record_rpc("", 1.0, true, None);
        let snap = metrics.snapshot();
        assert_eq!(snap["rpc"]["by_method"]["unknown"], 1);
    }

    #[test]
    fn test_negative_latency_clamped() {
        let metrics = RuntimeMetrics::new();
        metrics.record_rpc("initialize", -5.0, true, None);
        let snap = metrics.snapshot();
        assert_eq!(snap["rpc"]["avg_latency_ms"], 0.0);
    }

    #[test]
    fn test_concurrent_recording() {
        use std::sync::Arc;
        let metrics = Arc::new(RuntimeMetrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let metrics = Arc::clone(&metrics);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    metrics.record_rpc("tools/call", 1.0, true, Some("t"));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(metrics.snapshot()["rpc"]["requests_total"], 800);
    }
}
