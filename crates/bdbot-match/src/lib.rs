//! LLM narrative matching: transport, prompt protocol and the matcher itself.

mod client;
mod protocol;

use std::time::Duration;

use async_trait::async_trait;
use bdbot_core::{RunContext, Solicitation};
use thiserror::Error;
use tracing::{debug, warn};

pub use client::{ChatMessage, CompletionClient, LlmSettings, OpenAiCompatClient, TransportError};
pub use protocol::{
    build_messages, parse_match_response, MatchVerdict, ProtocolError, MATCH_PROTOCOL_VERSION,
    MAX_DESCRIPTION_CHARS,
};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("match protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("narrative is empty")]
    EmptyNarrative,
}

impl MatchError {
    /// True when the run itself was cancelled or ran out of time.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Interrupted(_)))
    }
}

/// Scores one solicitation against one narrative. Implementations hold no
/// per-call state and are shared across concurrent tasks.
#[async_trait]
pub trait Matcher: Send + Sync {
    async fn evaluate(
        &self,
        ctx: &RunContext,
        narrative: &str,
        solicitation: &Solicitation,
    ) -> Result<MatchVerdict, MatchError>;
}

/// [`Matcher`] backed by a chat-completion endpoint. One attempt per call.
#[derive(Debug, Clone)]
pub struct LlmMatcher<C> {
    client: C,
    call_timeout: Duration,
}

impl<C: CompletionClient> LlmMatcher<C> {
    pub fn new(client: C, call_timeout: Duration) -> Self {
        Self {
            client,
            call_timeout,
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: CompletionClient> Matcher for LlmMatcher<C> {
    async fn evaluate(
        &self,
        ctx: &RunContext,
        narrative: &str,
        solicitation: &Solicitation,
    ) -> Result<MatchVerdict, MatchError> {
        if narrative.trim().is_empty() {
            return Err(MatchError::EmptyNarrative);
        }

        let messages = build_messages(narrative, solicitation);
        let call = ctx.child(self.call_timeout);
        let completion = self.client.complete(&call, &messages).await?;
        let verdict = parse_match_response(&completion)?;

        if verdict.was_clamped() {
            warn!(
                solicitation_id = solicitation.id,
                reported = verdict.reported_score,
                score = %verdict.score,
                "score outside 0-100, clamped"
            );
        }
        debug!(solicitation_id = solicitation.id, score = %verdict.score, "match verdict");
        Ok(verdict)
    }
}
