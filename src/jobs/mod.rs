//! Durable tracking for asynchronous tool invocations.
//!
//! Every state transition persists the whole job table as one JSON document
//! via write-to-temp-then-rename, so a reader never observes a torn file and
//! a restart recovers the last known state of every job. A job that was
//! `running` at crash time stays `running` after reload; operators see it as
//! stale rather than having it silently resolved.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{StoreError, StoreResult};

/// Lifecycle state of a job. Transitions are one-directional:
/// `queued -> running -> {succeeded | failed}`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Succeeded => write!(f, "succeeded"),
            JobState::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "succeeded" => Ok(JobState::Succeeded),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// One tracked asynchronous invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    /// Tool name this job executes.
    pub module: String,
    pub run_id: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Snapshot of the submitted arguments, kept for audit.
    pub inputs: Value,
    /// Present iff the job succeeded.
    pub result: Option<Value>,
    /// Present iff the job failed.
    pub error: Option<Value>,
}

/// Thread-safe job store with atomic whole-table persistence.
///
/// The in-memory table mutex is scoped to map access only. A separate async
/// persist mutex is held across snapshot+write so persisted state is
/// monotonic even when transitions race; readers never wait on file I/O.
pub struct JobStore {
    path: PathBuf,
    table: Mutex<HashMap<String, Job>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl JobStore {
    /// Open the store, reloading any previously persisted jobs.
    ///
    /// A missing file starts empty; an unreadable file is logged and
    /// treated as empty rather than refusing to start.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let table = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str::<HashMap<String, Job>>(&text) {
                Ok(jobs) => {
                    info!(path = %path.display(), jobs = jobs.len(), "Loaded job state");
                    jobs
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to parse job state, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read job state, starting empty");
                HashMap::new()
            }
        };

        Ok(Self {
            path,
            table: Mutex::new(table),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Insert a `queued` job and persist immediately.
    pub async fn create(
        &self,
        module: &str,
        run_id: Option<&str>,
        inputs: Option<Value>,
    ) -> StoreResult<String> {
        let now = Utc::now();
        let job_id = format!("job_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let job = Job {
            job_id: job_id.clone(),
            module: module.to_string(),
            run_id: run_id.map(str::to_string),
            state: JobState::Queued,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            inputs: inputs.unwrap_or_else(|| Value::Object(Default::default())),
            result: None,
            error: None,
        };

        self.mutate_and_persist(|table| {
            table.insert(job.job_id.clone(), job.clone());
        })
        .await?;

        Ok(job_id)
    }

    /// Move a queued job to `running`. Unknown ids and jobs not in `queued`
    /// are silent no-ops (a caller may have raced a clear or a retry).
    pub async fn mark_running(&self, job_id: &str) -> StoreResult<()> {
        let now = Utc::now();
        self.mutate_and_persist(|table| {
            if let Some(job) = table.get_mut(job_id) {
                if job.state == JobState::Queued {
                    job.state = JobState::Running;
                    job.started_at = Some(now);
                    job.updated_at = now;
                }
            }
        })
        .await
    }

    /// Finish a job successfully. No-op for unknown or already-terminal jobs.
    pub async fn mark_succeeded(&self, job_id: &str, result: Option<Value>) -> StoreResult<()> {
        let now = Utc::now();
        self.mutate_and_persist(|table| {
            if let Some(job) = table.get_mut(job_id) {
                if !job.state.is_terminal() {
                    job.state = JobState::Succeeded;
                    job.finished_at = Some(now);
                    job.updated_at = now;
                    job.result = Some(result.unwrap_or_else(|| Value::Object(Default::default())));
                    job.error = None;
                }
            }
        })
        .await
    }

    /// Finish a job with an error payload. No-op for unknown or terminal jobs.
    pub async fn mark_failed(&self, job_id: &str, error: Value) -> StoreResult<()> {
        let now = Utc::now();
        self.mutate_and_persist(|table| {
            if let Some(job) = table.get_mut(job_id) {
                if !job.state.is_terminal() {
                    job.state = JobState::Failed;
                    job.finished_at = Some(now);
                    job.updated_at = now;
                    job.error = Some(error.clone());
                }
            }
        })
        .await
    }

    /// Snapshot of one job.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        let table = self.table.lock().expect("job table lock poisoned");
        table.get(job_id).cloned()
    }

    /// Most-recently-updated jobs first, optionally filtered by state.
    pub fn list(&self, limit: usize, state: Option<JobState>) -> Vec<Job> {
        let mut rows: Vec<Job> = {
            let table = self.table.lock().expect("job table lock poisoned");
            table.values().cloned().collect()
        };
        if let Some(state) = state {
            rows.retain(|j| j.state == state);
        }
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        rows.truncate(limit.max(1));
        rows
    }

    /// Remove all jobs and persist the empty table.
    pub async fn clear(&self) -> StoreResult<()> {
        self.mutate_and_persist(|table| table.clear()).await
    }

    pub fn len(&self) -> usize {
        self.table.lock().expect("job table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a mutation under the table lock, then write the snapshot to
    /// disk while still holding the persist lock. The table lock itself is
    /// released before any I/O.
    async fn mutate_and_persist<F>(&self, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut HashMap<String, Job>),
    {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let mut table = self.table.lock().expect("job table lock poisoned");
            mutate(&mut table);
            table.clone()
        };
        write_json_atomic(&self.path, &snapshot).await
    }
}

/// Full rewrite to a temp file followed by an atomic rename, so a reader
/// never sees a half-written table and a crash mid-write cannot corrupt the
/// existing file.
async fn write_json_atomic<T: Serialize>(path: &Path, payload: &T) -> StoreResult<()> {
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
