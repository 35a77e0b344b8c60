//! Durable append-only audit trail of tool outcomes.
//!
//! One JSON array file per (run_id, session_id) composite key. Appends are
//! a full read-modify-rewrite behind a per-key async lock, with the rewrite
//! done as write-temp-then-rename so a reader never sees a torn file. Reads
//! are best-effort: a missing file is an empty history, and a corrupted file
//! degrades to a greedy partial recovery plus warning metadata instead of a
//! hard failure.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::config::StorageConfig;
use crate::error::{StoreError, StoreResult};

/// Read diagnostics surfaced alongside recovered entries so callers can
/// attach degraded-data warnings instead of silently losing history.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HistoryReadMeta {
    pub parse_errors: Vec<String>,
    pub skipped_records: usize,
}

impl HistoryReadMeta {
    pub fn is_clean(&self) -> bool {
        self.parse_errors.is_empty() && self.skipped_records == 0
    }
}

/// Append-only history ledger keyed by (run_id, session_id).
pub struct HistoryLedger {
    history_dir: PathBuf,
    /// Per-key write locks serializing the read-modify-rename sequence.
    key_locks: std::sync::Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl HistoryLedger {
    pub fn new(history_dir: impl Into<PathBuf>) -> Self {
        Self {
            history_dir: history_dir.into(),
            key_locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &StorageConfig) -> Self {
        Self::new(config.history_dir.clone())
    }

    /// File backing one (run, session) key. Session-scoped histories live in
    /// a per-run subdirectory so two sessions sharing a run_id never share a
    /// file.
    pub fn path_for(&self, run_id: &str, session_id: Option<&str>) -> PathBuf {
        let run = sanitize_component(run_id);
        match session_id {
            Some(session) => self
                .history_dir
                .join(&run)
                .join(format!("{}_history.json", sanitize_component(session))),
            None => self.history_dir.join(format!("{run}_history.json")),
        }
    }

    /// Append one entry, stamping `timestamp` on it.
    ///
    /// The whole file is rewritten atomically; concurrent appends to the
    /// same key are serialized by a per-key lock so none are dropped.
    pub async fn append(
        &self,
        run_id: &str,
        session_id: Option<&str>,
        entry: Value,
    ) -> StoreResult<()> {
        let mut obj = match entry {
            Value::Object(obj) => obj,
            other => {
                return Err(StoreError::Persistence {
                    message: format!(
                        "history entry must be a JSON object, got {}",
                        json_type_name(&other)
                    ),
                })
            }
        };
        obj.insert(
            "timestamp".to_string(),
            Value::String(Utc::now().to_rfc3339()),
        );

        let path = self.path_for(run_id, session_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;

        let (mut entries, meta) = read_history_file(&path).await;
        if !meta.is_clean() {
            warn!(
                path = %path.display(),
                skipped_records = meta.skipped_records,
                parse_errors = ?meta.parse_errors,
                "Recovered partial history before append"
            );
        }
        entries.push(Value::Object(obj));
        write_json_atomic(&path, &entries).await
    }

    /// Ordered entries for a key plus recovery diagnostics. Missing file is
    /// an empty history; corruption degrades to partial recovery.
    pub async fn read(
        &self,
        run_id: &str,
        session_id: Option<&str>,
    ) -> (Vec<Value>, HistoryReadMeta) {
        let path = self.path_for(run_id, session_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        read_history_file(&path).await
    }

    /// Reset one key by truncating its file to an empty array.
    pub async fn clear(&self, run_id: &str, session_id: Option<&str>) -> StoreResult<()> {
        let path = self.path_for(run_id, session_id);
        let lock = self.lock_for(&path);
        let _guard = lock.lock().await;
        write_json_atomic(&path, &Vec::<Value>::new()).await
    }

    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.key_locks.lock().expect("history lock table poisoned");
        // Drop entries nobody holds anymore, or the table grows by one
        // Arc per (run, session) key for the life of the process.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Best-effort read of one history file.
async fn read_history_file(path: &Path) -> (Vec<Value>, HistoryReadMeta) {
    let mut meta = HistoryReadMeta::default();

    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (Vec::new(), meta),
        Err(e) => {
            meta.parse_errors.push(format!("read failed: {e}"));
            return (Vec::new(), meta);
        }
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return (Vec::new(), meta);
    }

    match serde_json::from_str::<Value>(raw) {
        Ok(parsed) => (coerce_entries(parsed, &mut meta), meta),
        Err(e) => {
            meta.parse_errors.push(format!("JSON parse error: {e}"));
            let recovered = recover_entries(raw, &mut meta);
            (recovered, meta)
        }
    }
}

/// Shape a successfully parsed document into an entry list. A bare object
/// counts as a single-entry history; non-object array items are skipped.
fn coerce_entries(parsed: Value, meta: &mut HistoryReadMeta) -> Vec<Value> {
    match parsed {
        Value::Array(items) => items
            .into_iter()
            .filter(|item| {
                if item.is_object() {
                    true
                } else {
                    meta.skipped_records += 1;
                    false
                }
            })
            .collect(),
        obj @ Value::Object(_) => vec![obj],
        _ => {
            meta.parse_errors
                .push("History root is not a list/object.".to_string());
            meta.skipped_records += 1;
            Vec::new()
        }
    }
}

/// Greedy recovery pass over corrupted text: walk the raw bytes, decode
/// whatever complete JSON values remain, keep the objects, and count
/// everything unparseable as skipped.
fn recover_entries(raw: &str, meta: &mut HistoryReadMeta) -> Vec<Value> {
    let bytes = raw.as_bytes();
    let mut recovered = Vec::new();
    let mut idx = 0;

    while idx < bytes.len() {
        while idx < bytes.len() && matches!(bytes[idx], b' ' | b'\t' | b'\r' | b'\n' | b'[' | b']' | b',') {
            idx += 1;
        }
        if idx >= bytes.len() {
            break;
        }
        let mut stream = serde_json::Deserializer::from_str(&raw[idx..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(item)) => {
                let consumed = stream.byte_offset();
                if item.is_object() {
                    recovered.push(item);
                } else {
                    meta.skipped_records += 1;
                }
                idx += consumed.max(1);
            }
            _ => {
                meta.skipped_records += 1;
                // Step over one whole character, not one byte, so multi-byte
                // garbage cannot land the next slice inside a char boundary.
                idx += raw[idx..].chars().next().map_or(1, char::len_utf8);
            }
        }
    }

    if recovered.is_empty() {
        meta.parse_errors
            .push("Unable to recover any valid history entries.".to_string());
    }
    recovered
}

/// Full rewrite via temp file plus atomic rename.
async fn write_json_atomic(path: &Path, payload: &Vec<Value>) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let text = serde_json::to_string_pretty(payload)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, text.as_bytes()).await?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| StoreError::Persistence {
            message: format!("atomic rename to {} failed: {e}", path.display()),
        })?;
    Ok(())
}

/// Keep ids filesystem-safe before they become path components.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
