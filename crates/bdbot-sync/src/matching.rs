//! Match-for-user and clear-for-user batch runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bdbot_core::{MatchStore, RunContext, SolicitationStore, User, UserDirectory, UserSelector};
use bdbot_match::{MatchError, Matcher};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::RunError;

#[derive(Debug, Clone, Serialize)]
pub struct MatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub user_id: i64,
    pub user_email: String,
    pub solicitations: usize,
    pub matched: usize,
    pub protocol_failures: usize,
    pub transport_failures: usize,
    pub store_failures: usize,
    /// Never evaluated: the deadline passed or the run aborted first.
    pub skipped: usize,
    pub aborted: Option<String>,
}

impl MatchSummary {
    pub fn failed(&self) -> usize {
        self.protocol_failures + self.transport_failures + self.store_failures
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearSummary {
    pub user_id: i64,
    pub user_email: String,
    pub removed: u64,
}

enum ItemOutcome {
    Saved,
    Protocol,
    Transport,
    Interrupted,
    Store,
    Unavailable(String),
}

/// Everything a match run reads from and writes to.
#[derive(Clone)]
pub struct MatchRunner {
    pub users: Arc<dyn UserDirectory>,
    pub solicitations: Arc<dyn SolicitationStore>,
    pub matches: Arc<dyn MatchStore>,
    pub matcher: Arc<dyn Matcher>,
    pub concurrency: usize,
}

async fn resolve_user(users: &dyn UserDirectory, selector: &UserSelector) -> Result<User, RunError> {
    users
        .resolve(selector)
        .await?
        .ok_or_else(|| RunError::UserNotFound(selector.clone()))
}

impl MatchRunner {
    /// Score every stored solicitation against the user's narrative.
    ///
    /// Full rescan, at most `concurrency` evaluations in flight. Each success is
    /// written immediately, so an interrupted run keeps what it finished.
    pub async fn run(&self, ctx: &RunContext, selector: &UserSelector) -> Result<MatchSummary, RunError> {
        let user = resolve_user(self.users.as_ref(), selector).await?;
        if !user.has_narrative() {
            return Err(RunError::EmptyNarrative { user_id: user.id });
        }
        let solicitations = self.solicitations.list().await?;
        info!(
            run_id = %ctx.run_id(),
            user = %user.email,
            solicitations = solicitations.len(),
            "match run starting"
        );

        let narrative: Arc<str> = Arc::from(user.narrative.as_str());
        let limit = Arc::new(Semaphore::new(self.concurrency.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();
        let total = solicitations.len();
        let mut issued = 0usize;

        for solicitation in solicitations {
            let permit = match ctx.run(Arc::clone(&limit).acquire_owned()).await {
                Ok(Ok(permit)) => permit,
                _ => break,
            };
            if halted.load(Ordering::SeqCst) {
                break;
            }
            issued += 1;

            let ctx = ctx.clone();
            let matcher = Arc::clone(&self.matcher);
            let matches = Arc::clone(&self.matches);
            let narrative = Arc::clone(&narrative);
            let halted = Arc::clone(&halted);
            let user_id = user.id;
            let span = info_span!("match", run_id = %ctx.run_id(), solicitation_id = solicitation.id);

            tasks.spawn(
                async move {
                    let _permit = permit;
                    let verdict = match ctx.run(matcher.evaluate(&ctx, &narrative, &solicitation)).await {
                        Ok(Ok(verdict)) => verdict,
                        Ok(Err(err)) => return classify(&solicitation.source_id, err),
                        Err(_) => return ItemOutcome::Interrupted,
                    };
                    match matches
                        .upsert(user_id, solicitation.id, verdict.score, &verdict.explanation)
                        .await
                    {
                        Ok(()) => {
                            info!(title = %solicitation.title, score = %verdict.score, "match saved");
                            ItemOutcome::Saved
                        }
                        Err(err) if err.is_unavailable() => {
                            error!(error = %err, "store unavailable, aborting match run");
                            halted.store(true, Ordering::SeqCst);
                            ItemOutcome::Unavailable(err.to_string())
                        }
                        Err(err) => {
                            error!(error = %err, "failed to save match");
                            ItemOutcome::Store
                        }
                    }
                }
                .instrument(span),
            );
        }

        let mut summary = MatchSummary {
            run_id: ctx.run_id(),
            started_at: ctx.started_at(),
            finished_at: ctx.started_at(),
            user_id: user.id,
            user_email: user.email.clone(),
            solicitations: total,
            matched: 0,
            protocol_failures: 0,
            transport_failures: 0,
            store_failures: 0,
            skipped: total - issued,
            aborted: None,
        };

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(ItemOutcome::Saved) => summary.matched += 1,
                Ok(ItemOutcome::Protocol) => summary.protocol_failures += 1,
                Ok(ItemOutcome::Transport) => summary.transport_failures += 1,
                Ok(ItemOutcome::Interrupted) => summary.skipped += 1,
                Ok(ItemOutcome::Store) => summary.store_failures += 1,
                Ok(ItemOutcome::Unavailable(reason)) => {
                    summary.store_failures += 1;
                    summary.aborted.get_or_insert(reason);
                }
                Err(join_err) => {
                    error!(error = %join_err, "match task did not finish");
                    summary.transport_failures += 1;
                }
            }
        }

        if let Err(reason) = ctx.check() {
            warn!(run_id = %ctx.run_id(), %reason, skipped = summary.skipped, "match run stopped early");
        }
        summary.finished_at = Utc::now();
        info!(
            run_id = %summary.run_id,
            user = %summary.user_email,
            matched = summary.matched,
            failed = summary.failed(),
            skipped = summary.skipped,
            "match run complete"
        );
        Ok(summary)
    }

    pub async fn clear(&self, selector: &UserSelector) -> Result<ClearSummary, RunError> {
        clear_matches(self.users.as_ref(), self.matches.as_ref(), selector).await
    }
}

fn classify(source_id: &str, err: MatchError) -> ItemOutcome {
    match err {
        MatchError::Protocol(ref protocol) => {
            warn!(%source_id, error = %protocol, "unusable model response, skipping");
            ItemOutcome::Protocol
        }
        err if err.is_interrupted() => ItemOutcome::Interrupted,
        err => {
            error!(%source_id, error = %err, "match failed");
            ItemOutcome::Transport
        }
    }
}

/// Delete every stored match for the selected user.
pub async fn clear_matches(
    users: &dyn UserDirectory,
    matches: &dyn MatchStore,
    selector: &UserSelector,
) -> Result<ClearSummary, RunError> {
    let user = resolve_user(users, selector).await?;
    let removed = matches.clear_for_user(user.id).await?;
    info!(user = %user.email, user_id = user.id, removed, "matches cleared");
    Ok(ClearSummary {
        user_id: user.id,
        user_email: user.email,
        removed,
    })
}
