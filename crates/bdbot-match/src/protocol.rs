//! Score-and-rationale framing layered over the chat transport.
//!
//! The model is asked for a single JSON object `{"score": <0-100>, "explanation": "..."}`.
//! The parser is strict about content (a score and a non-empty explanation must
//! both be present) but tolerant about wrapping: surrounding prose and Markdown
//! code fences are ignored.

use bdbot_core::{Score, Solicitation};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::ChatMessage;

pub const MATCH_PROTOCOL_VERSION: &str = "bdbot-match/v1";

/// Descriptions longer than this are cut before prompting.
pub const MAX_DESCRIPTION_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty completion")]
    EmptyBody,
    #[error("completion contains no JSON object")]
    NoJsonObject,
    #[error("malformed JSON in completion: {0}")]
    MalformedJson(String),
    #[error("completion has no score")]
    MissingScore,
    #[error("score is not numeric: {0}")]
    NonNumericScore(String),
    #[error("completion has no explanation")]
    MissingExplanation,
}

/// A parsed, validated model answer.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchVerdict {
    pub score: Score,
    pub explanation: String,
    /// The number as the model reported it, before clamping.
    pub reported_score: f64,
}

impl MatchVerdict {
    pub fn was_clamped(&self) -> bool {
        f64::from(self.score.value()) != self.reported_score.round()
    }
}

fn system_prompt() -> String {
    format!(
        "You assess how well a government solicitation fits a company's capabilities. \
         Protocol {MATCH_PROTOCOL_VERSION}: reply with exactly one JSON object and nothing else, \
         shaped as {{\"score\": <integer 0-100>, \"explanation\": \"<one or two sentences>\"}}. \
         100 means an excellent fit, 0 means no fit."
    )
}

pub fn build_messages(narrative: &str, solicitation: &Solicitation) -> Vec<ChatMessage> {
    let due = solicitation
        .due_date
        .map(|d| d.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "not stated".to_string());
    let user = format!(
        "Company narrative:\n{narrative}\n\n\
         Solicitation:\n\
         Title: {title}\n\
         Agency: {agency}\n\
         Due: {due}\n\
         URL: {url}\n\
         Description:\n{description}",
        narrative = narrative.trim(),
        title = solicitation.title,
        agency = or_unknown(&solicitation.agency),
        url = or_unknown(&solicitation.url),
        description = truncate_chars(&solicitation.description, MAX_DESCRIPTION_CHARS),
    );
    vec![ChatMessage::system(system_prompt()), ChatMessage::user(user)]
}

fn or_unknown(value: &str) -> &str {
    if value.trim().is_empty() {
        "unknown"
    } else {
        value
    }
}

fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &value[..cut]),
        None => value.to_string(),
    }
}

pub fn parse_match_response(text: &str) -> Result<MatchVerdict, ProtocolError> {
    let body = strip_code_fence(text.trim());
    if body.is_empty() {
        return Err(ProtocolError::EmptyBody);
    }

    let Some(start) = body.find('{') else {
        return Err(ProtocolError::NoJsonObject);
    };

    // Exactly one object from the first brace; whatever follows it is prose.
    let value = serde_json::Deserializer::from_str(&body[start..])
        .into_iter::<JsonValue>()
        .next()
        .ok_or(ProtocolError::NoJsonObject)?
        .map_err(|e| ProtocolError::MalformedJson(e.to_string()))?;

    let reported_score = match value.get("score") {
        None | Some(JsonValue::Null) => return Err(ProtocolError::MissingScore),
        Some(JsonValue::Number(n)) => n
            .as_f64()
            .ok_or_else(|| ProtocolError::NonNumericScore(n.to_string()))?,
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ProtocolError::NonNumericScore(s.clone()))?,
        Some(other) => return Err(ProtocolError::NonNumericScore(other.to_string())),
    };

    let explanation = value
        .get("explanation")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or(ProtocolError::MissingExplanation)?
        .to_string();

    Ok(MatchVerdict {
        score: Score::clamped(reported_score),
        explanation,
        reported_score,
    })
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    rest.trim_end().trim_end_matches("```").trim()
}
