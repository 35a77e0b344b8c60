use std::env;
use std::path::PathBuf;

use crate::error::AppError;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub sessions: SessionConfig,
    pub storage: StorageConfig,
    pub artifacts: ArtifactConfig,
    pub resources: ResourceConfig,
    pub logging: LoggingConfig,
}

/// HTTP transport configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Shared-secret bearer token. Empty means open access.
    pub auth_token: String,
}

/// Session store configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Seconds of inactivity before a session is evicted.
    pub ttl_sec: u64,
    /// Reject calls whose run_id differs from the session-bound one
    /// instead of coercing to the bound run_id with a warning.
    pub strict_run_id: bool,
}

/// Durable state paths
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Job table JSON document.
    pub job_state_path: PathBuf,
    /// Directory holding per-(run, session) history files.
    pub history_dir: PathBuf,
    /// Default root for local data exports.
    pub export_dir: PathBuf,
}

/// Remote object store configuration
#[derive(Debug, Clone)]
pub struct ArtifactConfig {
    /// Bucket URI, e.g. "gs://analyst-reports". Empty disables uploads.
    pub bucket: String,
    /// Blob prefix inside the bucket.
    pub prefix: String,
    /// HTTP endpoint of the object store. Overridable for emulators/tests.
    pub endpoint: String,
}

/// Resource template configuration
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    pub template_dir: PathBuf,
    /// Timeout for resource list/read I/O, in seconds.
    pub io_timeout_sec: u64,
    /// Advertise URI templates via resources/templates/list. Off by default
    /// so clients listing concrete resources do not see duplicates.
    pub advertise_templates: bool,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, PartialEq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let server = ServerConfig {
            host: env::var("ANALYST_MCP_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("ANALYST_MCP_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8001),
            auth_token: env::var("ANALYST_MCP_AUTH_TOKEN")
                .unwrap_or_default()
                .trim()
                .to_string(),
        };

        let sessions = SessionConfig {
            ttl_sec: env::var("ANALYST_MCP_SESSION_TTL_SEC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3600),
            strict_run_id: env_flag("ANALYST_MCP_STRICT_RUN_ID"),
        };

        let storage = StorageConfig {
            job_state_path: PathBuf::from(
                env::var("ANALYST_MCP_JOB_STATE_PATH")
                    .unwrap_or_else(|_| "exports/reports/jobs/job_state.json".to_string()),
            ),
            history_dir: PathBuf::from(
                env::var("ANALYST_MCP_HISTORY_DIR")
                    .unwrap_or_else(|_| "exports/reports/history".to_string()),
            ),
            export_dir: PathBuf::from(
                env::var("ANALYST_MCP_EXPORT_DIR").unwrap_or_else(|_| "exports/data".to_string()),
            ),
        };

        let artifacts = ArtifactConfig {
            bucket: env::var("ANALYST_REPORT_BUCKET")
                .unwrap_or_default()
                .trim()
                .trim_end_matches('/')
                .to_string(),
            prefix: env::var("ANALYST_REPORT_PREFIX")
                .unwrap_or_else(|_| "analyst_toolkit/reports".to_string())
                .trim()
                .trim_matches('/')
                .to_string(),
            endpoint: env::var("ANALYST_OBJECT_STORE_ENDPOINT")
                .unwrap_or_else(|_| "https://storage.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
        };

        let resources = ResourceConfig {
            template_dir: PathBuf::from(
                env::var("ANALYST_MCP_TEMPLATE_DIR")
                    .unwrap_or_else(|_| "config/golden_templates".to_string()),
            ),
            io_timeout_sec: env::var("ANALYST_MCP_RESOURCE_TIMEOUT_SEC")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(8),
            advertise_templates: env_flag("ANALYST_MCP_ADVERTISE_RESOURCE_TEMPLATES"),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "pretty".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        };

        if server.port == 0 {
            return Err(AppError::Config {
                message: "ANALYST_MCP_PORT must be a non-zero port number".to_string(),
            });
        }

        Ok(Config {
            server,
            sessions,
            storage,
            artifacts,
            resources,
            logging,
        })
    }
}

fn env_flag(name: &str) -> bool {
    matches!(
        env::var(name)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_sec: 3600,
            strict_run_id: false,
        }
    }
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            prefix: "analyst_toolkit/reports".to_string(),
            endpoint: "https://storage.googleapis.com".to_string(),
        }
    }
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("config/golden_templates"),
            io_timeout_sec: 8,
            advertise_templates: false,
        }
    }
}
