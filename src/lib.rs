//! # Analyst Toolkit MCP Server
//!
//! A control-plane service exposing data-processing tools over JSON-RPC 2.0.
//! Tools operate on server-held tabular datasets addressed by session ids,
//! record their outcomes in a durable per-run history ledger, publish report
//! artifacts to a remote object store, and can run asynchronously under a
//! restart-safe job store.
//!
//! ## Architecture
//!
//! ```text
//! MCP Client → HTTP POST /rpc → RpcDispatcher → ToolRegistry
//!                                    ↓               ↓
//!                              RuntimeMetrics   SessionStore / JobStore
//!                                                HistoryLedger (JSON files)
//!                                                ArtifactPublisher (object store)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mcp_analyst_toolkit::{Config, server::{http, AppState}};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = Arc::new(AppState::from_config(config).await?);
//!     http::serve(state).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

/// Artifact uploads and the expected-vs-delivered artifact contract.
pub mod artifacts;
/// Configuration management loaded from environment variables.
pub mod config;
/// Tabular dataset payload shared by sessions and tools.
pub mod dataset;
/// Error types, JSON-RPC codes, and the structured error envelope.
pub mod error;
/// Durable append-only history of tool outcomes per (run, session).
pub mod history;
/// Restart-safe tracking of asynchronous tool invocations.
pub mod jobs;
/// Runtime request metrics for the operability endpoints.
pub mod observability;
/// YAML configuration templates exposed as MCP resources.
pub mod resources;
/// HTTP transport, JSON-RPC dispatch, and shared server state.
pub mod server;
/// In-memory dataset sessions with TTL eviction and run binding.
pub mod session;
/// Tool registry and the built-in toolkit.
pub mod tools;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, SharedState};
