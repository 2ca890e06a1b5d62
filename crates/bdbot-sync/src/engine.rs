//! Scrape engine: an ordered adapter registry run under one deadline.

use std::sync::Arc;
use std::time::Duration;

use bdbot_adapters::{
    adapter_for_source, AdapterContext, AdapterError, FetchOutcome, ItemError, SourceAdapter,
};
use bdbot_core::{Interrupted, NewSolicitation, RunContext};
use bdbot_storage::HttpFetcher;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::SourceRegistry;

/// How long an interrupted source may take to unwind before its task is aborted.
const ABORT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("source {0} is already registered")]
    DuplicateSource(String),
    #[error("cannot build source {name}: {error}")]
    Adapter {
        name: String,
        #[source]
        error: AdapterError,
    },
}

/// How one registered source ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceStatus {
    Completed,
    Failed { reason: String },
    Panicked { reason: String },
    Interrupted { reason: String },
    /// The deadline passed before the source got a slot.
    NotStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: String,
    #[serde(flatten)]
    pub status: SourceStatus,
    pub listings: usize,
    pub item_errors: Vec<ItemError>,
    pub elapsed_ms: u128,
}

impl SourceReport {
    pub fn failed(&self) -> bool {
        self.status != SourceStatus::Completed
    }

    fn reason(&self) -> String {
        match &self.status {
            SourceStatus::Completed => "completed".to_string(),
            SourceStatus::Failed { reason } => reason.clone(),
            SourceStatus::Panicked { reason } => format!("panicked: {reason}"),
            SourceStatus::Interrupted { reason } => format!("interrupted: {reason}"),
            SourceStatus::NotStarted => "not started before deadline".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub reason: String,
}

/// Every source that did not complete, in registration order.
#[derive(Debug, Clone, Error)]
#[error("{} source(s) failed: {}", .failures.len(), describe(.failures))]
pub struct ScrapeError {
    pub failures: Vec<SourceFailure>,
}

fn describe(failures: &[SourceFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.source, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Serialize)]
pub struct ScrapeReport {
    pub run_id: Uuid,
    /// Source order, then discovery order. No cross-source dedup.
    #[serde(skip)]
    pub listings: Vec<NewSolicitation>,
    pub sources: Vec<SourceReport>,
}

impl ScrapeReport {
    pub fn error(&self) -> Option<ScrapeError> {
        let failures = self
            .sources
            .iter()
            .filter(|s| s.failed())
            .map(|s| SourceFailure {
                source: s.source.clone(),
                reason: s.reason(),
            })
            .collect::<Vec<_>>();
        if failures.is_empty() {
            None
        } else {
            Some(ScrapeError { failures })
        }
    }

    pub fn item_error_count(&self) -> usize {
        self.sources.iter().map(|s| s.item_errors.len()).sum()
    }
}

enum SourceRun {
    Fetched(FetchOutcome),
    Failed(AdapterError),
    Interrupted(Interrupted),
    NotStarted,
}

pub struct ScrapeEngine {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    http: Arc<HttpFetcher>,
    concurrency: usize,
}

impl ScrapeEngine {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self {
            adapters: Vec::new(),
            http,
            concurrency: 2,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Enabled registry entries, in file order.
    pub fn from_registry(registry: &SourceRegistry, http: Arc<HttpFetcher>) -> Result<Self, EngineError> {
        let mut engine = Self::new(http);
        for def in registry.enabled() {
            let adapter = adapter_for_source(def).map_err(|error| EngineError::Adapter {
                name: def.name.clone(),
                error,
            })?;
            engine.register(adapter)?;
        }
        Ok(engine)
    }

    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<(), EngineError> {
        if self.adapters.iter().any(|a| a.name() == adapter.name()) {
            return Err(EngineError::DuplicateSource(adapter.name().to_string()));
        }
        self.adapters.push(adapter);
        Ok(())
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Run every adapter; never fails as a whole.
    ///
    /// Sources are isolated from each other: an error or panic in one is recorded
    /// in its [`SourceReport`] and the rest carry on. Once `ctx` is interrupted no
    /// further source starts and in-flight ones are cancelled; whatever completed
    /// sources returned is kept.
    pub async fn run(&self, ctx: &RunContext) -> ScrapeReport {
        let limit = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(self.adapters.len());

        for adapter in &self.adapters {
            let name = adapter.name().to_string();
            let span = info_span!("source", run_id = %ctx.run_id(), source = %name);
            let adapter = Arc::clone(adapter);
            let http = Arc::clone(&self.http);
            let limit = Arc::clone(&limit);
            let ctx = ctx.clone();

            let task = async move {
                let _permit = match ctx.run(limit.acquire_owned()).await {
                    Ok(Ok(permit)) => permit,
                    _ => return SourceRun::NotStarted,
                };
                let actx = AdapterContext {
                    run: &ctx,
                    http: &http,
                };
                match ctx.run(adapter.fetch(&actx)).await {
                    Ok(Ok(outcome)) => SourceRun::Fetched(outcome),
                    Ok(Err(err)) => match err.interruption() {
                        Some(reason) => SourceRun::Interrupted(reason),
                        None => SourceRun::Failed(err),
                    },
                    Err(reason) => SourceRun::Interrupted(reason),
                }
            };
            handles.push((name, Instant::now(), tokio::spawn(task.instrument(span))));
        }

        let mut report = ScrapeReport {
            run_id: ctx.run_id(),
            listings: Vec::new(),
            sources: Vec::with_capacity(handles.len()),
        };

        for (name, started, mut handle) in handles {
            let joined = tokio::select! {
                joined = &mut handle => joined,
                _ = ctx.done() => match tokio::time::timeout(ABORT_GRACE, &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        handle.abort();
                        (&mut handle).await
                    }
                },
            };

            let mut source = SourceReport {
                source: name.clone(),
                status: SourceStatus::Completed,
                listings: 0,
                item_errors: Vec::new(),
                elapsed_ms: started.elapsed().as_millis(),
            };
            match joined {
                Ok(SourceRun::Fetched(outcome)) => {
                    source.listings = outcome.listings.len();
                    for item in &outcome.item_errors {
                        warn!(source = %name, locator = %item.locator, reason = %item.reason, "listing skipped");
                    }
                    info!(source = %name, listings = source.listings, skipped = outcome.item_errors.len(), "source completed");
                    source.item_errors = outcome.item_errors;
                    report.listings.extend(outcome.listings);
                }
                Ok(SourceRun::Failed(err)) => {
                    error!(source = %name, error = %err, "source failed");
                    source.status = SourceStatus::Failed {
                        reason: err.to_string(),
                    };
                }
                Ok(SourceRun::Interrupted(reason)) => {
                    warn!(source = %name, %reason, "source interrupted");
                    source.status = SourceStatus::Interrupted {
                        reason: reason.to_string(),
                    };
                }
                Ok(SourceRun::NotStarted) => {
                    warn!(source = %name, "source not started before deadline");
                    source.status = SourceStatus::NotStarted;
                }
                Err(join_err) if join_err.is_panic() => {
                    error!(source = %name, "source panicked");
                    source.status = SourceStatus::Panicked {
                        reason: panic_message(join_err.into_panic()),
                    };
                }
                Err(_) => {
                    warn!(source = %name, "source cancelled at deadline");
                    source.status = SourceStatus::Interrupted {
                        reason: ctx.check().err().unwrap_or(Interrupted::Cancelled).to_string(),
                    };
                }
            }
            report.sources.push(source);
        }

        report
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
