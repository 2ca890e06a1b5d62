//! Batch orchestration: configuration, scrape engine and the ingest/match drivers.

pub mod config;
mod engine;
mod ingest;
mod matching;

use bdbot_core::{StoreError, UserSelector};
use thiserror::Error;

pub use config::{
    load_source_registry, AppConfig, ConfigError, SourceRegistry, DEFAULT_CONFIG_PATH,
    DEFAULT_SOURCES_PATH,
};
pub use engine::{
    EngineError, ScrapeEngine, ScrapeError, ScrapeReport, SourceFailure, SourceReport,
    SourceStatus,
};
pub use ingest::{run_ingest, IngestSummary};
pub use matching::{clear_matches, ClearSummary, MatchRunner, MatchSummary};

/// Failures that stop a batch run before (or instead of) its summary.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("user not found ({0})")]
    UserNotFound(UserSelector),
    #[error("user {user_id} has no narrative; nothing to match")]
    EmptyNarrative { user_id: i64 },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("run aborted: {0}")]
    Aborted(String),
}
