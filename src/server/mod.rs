//! Server state wiring and the HTTP/JSON-RPC front door.

pub mod http;
pub mod rpc;

use std::sync::Arc;

use crate::artifacts::ArtifactPublisher;
use crate::config::Config;
use crate::error::AppResult;
use crate::history::HistoryLedger;
use crate::jobs::JobStore;
use crate::observability::RuntimeMetrics;
use crate::resources::ResourceCatalog;
use crate::session::SessionStore;
use crate::tools::{ToolContext, ToolRegistry};

/// All long-lived server state, explicitly constructed and shared by Arc.
pub struct AppState {
    pub config: Config,
    pub tools: ToolRegistry,
    pub ctx: Arc<ToolContext>,
    pub resources: ResourceCatalog,
    pub metrics: RuntimeMetrics,
}

/// Shared application state across request handlers.
pub type SharedState = Arc<AppState>;

impl AppState {
    /// Build the full state graph from configuration, reloading any
    /// persisted job table.
    pub async fn from_config(config: Config) -> AppResult<Self> {
        let sessions = Arc::new(SessionStore::from_config(&config.sessions));
        let jobs = Arc::new(JobStore::open(config.storage.job_state_path.clone()).await?);
        let history = Arc::new(HistoryLedger::from_config(&config.storage));
        let publisher = Arc::new(ArtifactPublisher::new(&config.artifacts));
        let ctx = Arc::new(ToolContext::new(
            &config, sessions, jobs, history, publisher,
        ));
        let resources = ResourceCatalog::from_config(&config.resources);

        Ok(Self {
            config,
            tools: ToolRegistry::with_builtin_tools(),
            ctx,
            resources,
            metrics: RuntimeMetrics::new(),
        })
    }
}
