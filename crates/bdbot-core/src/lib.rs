//! Core domain model, store contracts and run context for bdbot.

mod context;
mod store;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub use context::{CancelHandle, Interrupted, RunContext};
pub use store::{MatchStore, SolicitationStore, StoreError, UserDirectory};

/// User matched when an operator names neither an id nor an email.
pub const DEFAULT_USER_ID: i64 = 1;

/// Build the globally unique `source_id` for a provider-local identifier.
///
/// Returns `None` when the local identifier is blank, so adapters can report
/// the row as unparseable instead of persisting a bare namespace.
pub fn source_key(namespace: &str, local_id: &str) -> Option<String> {
    let namespace = namespace.trim().to_ascii_lowercase();
    let local_id = local_id.trim();
    if namespace.is_empty() || local_id.is_empty() {
        return None;
    }
    Some(format!("{namespace}-{local_id}"))
}

/// Normalized listing handed from source adapters to the solicitation store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSolicitation {
    pub source_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agency: String,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub url: String,
    /// Source payload kept verbatim for audit; never interpreted downstream.
    #[serde(default)]
    pub raw_data: JsonValue,
}

impl NewSolicitation {
    pub fn new(source_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            title: title.into(),
            description: String::new(),
            agency: String::new(),
            due_date: None,
            url: String::new(),
            raw_data: JsonValue::Object(Default::default()),
        }
    }
}

/// Persisted solicitation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Solicitation {
    pub id: i64,
    pub source_id: String,
    pub title: String,
    pub description: String,
    pub agency: String,
    pub due_date: Option<DateTime<Utc>>,
    pub url: String,
    pub raw_data: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Relevance score, always inside `0..=100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Score(u8);

impl Score {
    pub const MIN: Score = Score(0);
    pub const MAX: Score = Score(100);

    /// Round and clamp an arbitrary model-reported number into range.
    pub fn clamped(raw: f64) -> Self {
        if raw.is_nan() {
            return Self::MIN;
        }
        Self(raw.round().clamp(0.0, 100.0) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl From<Score> for i32 {
    fn from(score: Score) -> Self {
        i32::from(score.0)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored relevance of one solicitation to one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub user_id: i64,
    pub solicitation_id: i64,
    pub score: Score,
    pub explanation: String,
    pub updated_at: DateTime<Utc>,
}

/// Read-only view of a user record owned by the account subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub narrative: String,
}

impl User {
    pub fn has_narrative(&self) -> bool {
        !self.narrative.trim().is_empty()
    }
}

/// How an operator names the user a match run targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserSelector {
    Id(i64),
    Email(String),
}

impl UserSelector {
    /// An explicit id wins over an email; neither falls back to [`DEFAULT_USER_ID`].
    pub fn from_flags(email: Option<String>, id: Option<i64>) -> Self {
        match (id, email) {
            (Some(id), _) if id != 0 => Self::Id(id),
            (_, Some(email)) if !email.trim().is_empty() => Self::Email(email.trim().to_string()),
            _ => Self::Id(DEFAULT_USER_ID),
        }
    }
}

impl fmt::Display for UserSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id={id}"),
            Self::Email(email) => write!(f, "email={email}"),
        }
    }
}
