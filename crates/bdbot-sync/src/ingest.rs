//! Scrape-and-ingest batch run.

use std::time::Duration;

use bdbot_core::{RunContext, SolicitationStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::engine::{ScrapeEngine, SourceFailure};

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub found: usize,
    pub saved: usize,
    pub failed: usize,
    /// Listings never persisted because the run aborted or was interrupted.
    pub skipped: usize,
    pub item_errors: usize,
    pub source_failures: Vec<SourceFailure>,
    /// Set when the store became unusable mid-run.
    pub aborted: Option<String>,
    /// Set when cancellation or the persistence deadline stopped the upserts.
    pub interrupted: Option<String>,
}

impl IngestSummary {
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

/// Scrape every source, then upsert each listing.
///
/// Persistence gets its own `persist_timeout` budget, so listings from sources
/// that completed are still saved when the scrape used up `ctx`'s deadline.
/// Cancelling the run stops the upserts. A single failed upsert is logged and
/// counted; a store that reports itself unavailable stops the run.
pub async fn run_ingest(
    engine: &ScrapeEngine,
    store: &dyn SolicitationStore,
    ctx: &RunContext,
    persist_timeout: Duration,
) -> IngestSummary {
    info!(run_id = %ctx.run_id(), sources = ?engine.source_names(), "scrape run starting");
    let report = engine.run(ctx).await;
    let source_failures = report
        .error()
        .map(|err| {
            error!(run_id = %ctx.run_id(), error = %err, "scrape finished with source failures");
            err.failures
        })
        .unwrap_or_default();

    let found = report.listings.len();
    let mut saved = 0usize;
    let mut failed = 0usize;
    let mut aborted = None;
    let mut interrupted = None;
    let persist = ctx.follow_up(persist_timeout);

    for listing in &report.listings {
        let upserted = match persist.run(store.upsert(listing)).await {
            Ok(result) => result,
            Err(reason) => {
                warn!(run_id = %ctx.run_id(), %reason, saved, "ingest interrupted, remaining listings not saved");
                interrupted = Some(reason.to_string());
                break;
            }
        };
        match upserted {
            Ok(_) => saved += 1,
            Err(err) if err.is_unavailable() => {
                error!(run_id = %ctx.run_id(), source_id = %listing.source_id, error = %err, "store unavailable, aborting ingest");
                failed += 1;
                aborted = Some(err.to_string());
                break;
            }
            Err(err) => {
                error!(source_id = %listing.source_id, error = %err, "failed to upsert solicitation");
                failed += 1;
            }
        }
    }

    let summary = IngestSummary {
        run_id: ctx.run_id(),
        started_at: ctx.started_at(),
        finished_at: Utc::now(),
        sources: report.sources.len(),
        found,
        saved,
        failed,
        skipped: found - saved - failed,
        item_errors: report.item_error_count(),
        source_failures,
        aborted,
        interrupted,
    };
    info!(
        run_id = %summary.run_id,
        found = summary.found,
        saved = summary.saved,
        failed = summary.failed,
        source_failures = summary.source_failures.len(),
        "scrape run complete"
    );
    summary
}
