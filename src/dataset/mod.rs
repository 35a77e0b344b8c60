//! Tabular payload handled by the toolkit tools.
//!
//! The control plane treats datasets as opaque: it only needs shape metadata
//! for session bookkeeping and a JSON-safe descriptor for history entries.
//! Tools load datasets from inline records, a bound session, or a local
//! `.json`/`.csv` file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ToolError, ToolResult};

/// Row-major tabular dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    /// Column names, in order.
    pub columns: Vec<String>,
    /// Row values, one `Vec<Value>` per row, aligned with `columns`.
    pub rows: Vec<Vec<Value>>,
}

impl Dataset {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Values of one column, or None if the column does not exist.
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.columns.iter().position(|c| c == name)?;
        Some(self.rows.iter().map(|r| r.get(idx).unwrap_or(&Value::Null)).collect())
    }

    /// JSON-safe shape descriptor embedded in history entries instead of
    /// the raw payload.
    pub fn summary(&self) -> Value {
        json!({
            "_type": "dataset",
            "row_count": self.row_count(),
            "column_count": self.column_count(),
            "columns": self.columns,
        })
    }

    /// Build a dataset from an array of JSON objects (tool `rows` argument).
    /// Column order follows first appearance across records; missing keys
    /// become null.
    pub fn from_records(records: &[Value]) -> ToolResult<Self> {
        let mut columns: Vec<String> = Vec::new();
        for record in records {
            let obj = record.as_object().ok_or_else(|| ToolError::Validation {
                field: "rows".to_string(),
                reason: "every row must be a JSON object".to_string(),
            })?;
            for key in obj.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows = records
            .iter()
            .map(|record| {
                let obj = record.as_object().expect("validated above");
                columns
                    .iter()
                    .map(|c| obj.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        Ok(Self { columns, rows })
    }

    /// Rebuild the array-of-objects form.
    pub fn to_records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                let mut obj = Map::new();
                for (col, value) in self.columns.iter().zip(row.iter()) {
                    obj.insert(col.clone(), value.clone());
                }
                Value::Object(obj)
            })
            .collect()
    }

    /// Load from a local `.json` (array of objects) or `.csv` file.
    pub async fn from_path(path: &Path) -> ToolResult<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ToolError::Execution {
                message: format!("failed to read {}: {e}", path.display()),
            })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => {
                let records: Vec<Value> = serde_json::from_str(&text)?;
                Self::from_records(&records)
            }
            Some("csv") => Ok(Self::from_csv(&text)),
            other => Err(ToolError::Validation {
                field: "path".to_string(),
                reason: format!("unsupported extension: {other:?} (expected .json or .csv)"),
            }),
        }
    }

    /// Minimal CSV reader: header row, comma-separated with double-quote
    /// escaping, numbers parsed when they round-trip, everything else kept
    /// as strings.
    pub fn from_csv(text: &str) -> Self {
        let mut records = split_csv_records(text).into_iter();
        let columns: Vec<String> = match records.next() {
            Some(header) => header.into_iter().map(|c| c.trim().to_string()).collect(),
            None => return Self::new(Vec::new(), Vec::new()),
        };

        let rows = records
            .map(|record| {
                record
                    .into_iter()
                    .map(|cell| {
                        let cell = cell.trim();
                        if cell.is_empty() {
                            Value::Null
                        } else if let Ok(n) = cell.parse::<i64>() {
                            Value::from(n)
                        } else if let Ok(f) = cell.parse::<f64>() {
                            Value::from(f)
                        } else {
                            Value::String(cell.to_string())
                        }
                    })
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    /// Serialize as CSV text (for local/remote data exports). Cells holding
    /// commas, quotes, or line breaks are quoted so the output re-parses.
    pub fn to_csv(&self) -> String {
        let mut out = self
            .columns
            .iter()
            .map(|c| escape_csv_cell(c))
            .collect::<Vec<_>>()
            .join(",");
        out.push('\n');
        for row in &self.rows {
            let line: Vec<String> = row
                .iter()
                .map(|v| match v {
                    Value::Null => String::new(),
                    Value::String(s) => escape_csv_cell(s),
                    other => other.to_string(),
                })
                .collect();
            out.push_str(&line.join(","));
            out.push('\n');
        }
        out
    }
}

fn escape_csv_cell(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Split CSV text into records of raw cells, honoring quoted fields (which
/// may contain commas, doubled quotes, and line breaks).
fn split_csv_records(text: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut cell = String::new();
    let mut in_quotes = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    cell.push('"');
                }
                '"' => in_quotes = false,
                _ => cell.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut cell)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut cell));
                if !(record.len() == 1 && record[0].trim().is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => cell.push(c),
        }
    }
    if !cell.is_empty() || !record.is_empty() {
        record.push(cell);
        records.push(record);
    }
    records
}
