//! In-memory dataset sessions with TTL eviction.
//!
//! Sessions give stateless RPC callers a handle to a server-held dataset so
//! a pipeline of tool calls can pass data by id instead of re-uploading it.
//! Eviction is lazy: every `save` sweeps expired entries before writing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::SessionConfig;
use crate::dataset::Dataset;
use crate::error::{StoreError, StoreResult};

/// Shape metadata exposed by `get_metadata`/`list_sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionMetadata {
    pub row_count: usize,
    pub column_count: usize,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SessionEntry {
    dataset: Dataset,
    metadata: SessionMetadata,
    last_accessed: Instant,
    run_id: Option<String>,
}

/// Effective run id for a call, plus a warning when the caller's run id was
/// coerced back to the session-bound one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRun {
    pub run_id: Option<String>,
    pub warning: Option<String>,
}

/// Thread-safe in-memory session store.
///
/// The table mutex is scoped to map reads/writes only; dataset payloads are
/// cloned out so no lock is held while callers process data.
pub struct SessionStore {
    ttl: Duration,
    strict_run_id: bool,
    inner: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    pub fn new(ttl: Duration, strict_run_id: bool) -> Self {
        Self {
            ttl,
            strict_run_id,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_sec), config.strict_run_id)
    }

    /// Save a dataset, generating a fresh session id when none is given.
    ///
    /// Runs eviction first. Binds `run_id` on first association; a differing
    /// run id on an already-bound session is coerced back to the bound one
    /// with a warning, or rejected in strict mode.
    pub fn save(
        &self,
        dataset: Dataset,
        session_id: Option<&str>,
        run_id: Option<&str>,
    ) -> StoreResult<String> {
        let mut map = self.inner.lock().expect("session table lock poisoned");
        Self::evict_expired(&mut map, self.ttl);

        let session_id = match session_id {
            Some(id) => id.to_string(),
            None => format!("sess_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
        };

        let bound = map.get(&session_id).and_then(|e| e.run_id.clone());
        let effective_run_id = match (bound, run_id) {
            (Some(bound), Some(requested)) if bound != requested => {
                if self.strict_run_id {
                    return Err(StoreError::RunIdMismatch {
                        session_id,
                        bound,
                        requested: requested.to_string(),
                    });
                }
                warn!(
                    session_id = %session_id,
                    bound_run_id = %bound,
                    requested_run_id = %requested,
                    "run_id differs from session binding, coercing to bound run_id"
                );
                Some(bound)
            }
            (Some(bound), _) => Some(bound),
            (None, requested) => requested.map(str::to_string),
        };

        let metadata = SessionMetadata {
            row_count: dataset.row_count(),
            column_count: dataset.column_count(),
            updated_at: Utc::now(),
        };

        info!(
            session_id = %session_id,
            run_id = ?effective_run_id,
            rows = metadata.row_count,
            cols = metadata.column_count,
            "Saved session"
        );

        map.insert(
            session_id.clone(),
            SessionEntry {
                dataset,
                metadata,
                last_accessed: Instant::now(),
                run_id: effective_run_id,
            },
        );

        Ok(session_id)
    }

    /// Fetch the dataset, refreshing the access time (reads extend lifetime).
    pub fn get(&self, session_id: &str) -> Option<Dataset> {
        let mut map = self.inner.lock().expect("session table lock poisoned");
        let entry = map.get_mut(session_id)?;
        entry.last_accessed = Instant::now();
        Some(entry.dataset.clone())
    }

    pub fn get_metadata(&self, session_id: &str) -> Option<SessionMetadata> {
        let map = self.inner.lock().expect("session table lock poisoned");
        map.get(session_id).map(|e| e.metadata.clone())
    }

    /// Run id bound to a session, if any.
    pub fn bound_run_id(&self, session_id: &str) -> Option<String> {
        let map = self.inner.lock().expect("session table lock poisoned");
        map.get(session_id).and_then(|e| e.run_id.clone())
    }

    /// Resolve the effective run id for a call referencing `session_id`.
    ///
    /// Guards against a caller silently forking the execution ledger: when
    /// the session is bound to a run and the caller supplies a different
    /// one, the bound id wins (with a warning) unless strict mode rejects.
    pub fn resolve_run_id(
        &self,
        session_id: &str,
        requested: Option<&str>,
    ) -> StoreResult<ResolvedRun> {
        let bound = self.bound_run_id(session_id);
        match (bound, requested) {
            (Some(bound), Some(requested)) if bound != requested => {
                if self.strict_run_id {
                    return Err(StoreError::RunIdMismatch {
                        session_id: session_id.to_string(),
                        bound,
                        requested: requested.to_string(),
                    });
                }
                let warning = format!(
                    "run_id '{requested}' does not match session-bound run_id '{bound}'; \
                     using the bound run_id"
                );
                warn!(session_id = %session_id, %warning, "coerced run_id");
                Ok(ResolvedRun {
                    run_id: Some(bound),
                    warning: Some(warning),
                })
            }
            (Some(bound), _) => Ok(ResolvedRun {
                run_id: Some(bound),
                warning: None,
            }),
            (None, requested) => Ok(ResolvedRun {
                run_id: requested.map(str::to_string),
                warning: None,
            }),
        }
    }

    /// Session ids and shape metadata, without data payloads.
    pub fn list_sessions(&self) -> HashMap<String, SessionMetadata> {
        let map = self.inner.lock().expect("session table lock poisoned");
        map.iter()
            .map(|(k, v)| (k.clone(), v.metadata.clone()))
            .collect()
    }

    /// Remove one session, or all sessions when no id is given. Returns the
    /// number of sessions removed, counted under the table lock so a
    /// concurrent `save` cannot skew it.
    pub fn clear(&self, session_id: Option<&str>) -> usize {
        let mut map = self.inner.lock().expect("session table lock poisoned");
        match session_id {
            Some(id) => usize::from(map.remove(id).is_some()),
            None => {
                let removed = map.len();
                map.clear();
                removed
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("session table lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn evict_expired(map: &mut HashMap<String, SessionEntry>, ttl: Duration) {
        let expired: Vec<String> = map
            .iter()
            .filter(|(_, e)| e.last_accessed.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            map.remove(&id);
            info!(session_id = %id, "Evicted expired session (TTL reached)");
        }
    }
}
