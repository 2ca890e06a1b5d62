//! Source adapter contract + provider implementations.
//!
//! Each adapter owns everything provider-specific: retrieval, markup or JSON
//! parsing, field normalization and namespacing of provider-local ids into the
//! global `source_id`. The scrape engine only sees [`SourceAdapter`].

mod georgia;
mod json_feed;

use std::sync::Arc;

use async_trait::async_trait;
use bdbot_core::{Interrupted, NewSolicitation, RunContext};
use bdbot_storage::{FetchError, HttpFetcher};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use georgia::{GeorgiaGprAdapter, GEORGIA_GPR_DEFAULT_URL, GEORGIA_GPR_NAME, GEORGIA_NAMESPACE};
pub use json_feed::JsonFeedAdapter;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("parse error: {0}")]
    Parse(String),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    /// The run-level interruption behind this error, if that is what it is.
    pub fn interruption(&self) -> Option<Interrupted> {
        match self {
            Self::Interrupted(reason) | Self::Fetch(FetchError::Interrupted(reason)) => Some(*reason),
            _ => None,
        }
    }
}

/// Everything an adapter may use while fetching.
#[derive(Debug, Clone, Copy)]
pub struct AdapterContext<'a> {
    pub run: &'a RunContext,
    pub http: &'a HttpFetcher,
}

/// One listing the adapter saw but could not normalize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    /// Where the item sat in the provider response (row index, page url, ...).
    pub locator: String,
    pub reason: String,
}

/// Listings parsed so far plus the items that were skipped.
///
/// A non-empty `item_errors` is a partial success, not a failed fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub listings: Vec<NewSolicitation>,
    pub item_errors: Vec<ItemError>,
}

impl FetchOutcome {
    pub fn skip(&mut self, locator: impl Into<String>, reason: impl Into<String>) {
        self.item_errors.push(ItemError {
            locator: locator.into(),
            reason: reason.into(),
        });
    }

    pub fn extend(&mut self, other: FetchOutcome) {
        self.listings.extend(other.listings);
        self.item_errors.extend(other.item_errors);
    }

    pub fn is_partial(&self) -> bool {
        !self.item_errors.is_empty()
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry name; the engine rejects two adapters with the same name.
    fn name(&self) -> &str;

    /// Fetch and normalize every listing currently published by the provider.
    ///
    /// Must stop promptly once `ctx.run` is interrupted. Returns `Err` only when
    /// nothing usable could be retrieved.
    async fn fetch(&self, ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdapterKind {
    GeorgiaGpr,
    JsonFeed,
}

/// One entry of the `sources.yaml` registry file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDefinition {
    pub name: String,
    pub kind: AdapterKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub listing_urls: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl SourceDefinition {
    pub fn georgia_default() -> Self {
        Self {
            name: GEORGIA_GPR_NAME.to_string(),
            kind: AdapterKind::GeorgiaGpr,
            enabled: true,
            namespace: Some(GEORGIA_NAMESPACE.to_string()),
            listing_urls: vec![GEORGIA_GPR_DEFAULT_URL.to_string()],
            notes: Some("Georgia Procurement Registry open events".to_string()),
        }
    }
}

pub fn adapter_for_source(def: &SourceDefinition) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    match def.kind {
        AdapterKind::GeorgiaGpr => {
            let mut adapter = GeorgiaGprAdapter::new(def.listing_urls.clone()).named(&def.name);
            if let Some(namespace) = &def.namespace {
                adapter = adapter.with_namespace(namespace);
            }
            Ok(Arc::new(adapter))
        }
        AdapterKind::JsonFeed => {
            let namespace = def.namespace.as_deref().ok_or_else(|| {
                AdapterError::Message(format!("source {} (json-feed) needs a namespace", def.name))
            })?;
            if def.listing_urls.is_empty() {
                return Err(AdapterError::Message(format!(
                    "source {} (json-feed) needs at least one listing url",
                    def.name
                )));
            }
            Ok(Arc::new(JsonFeedAdapter::new(
                &def.name,
                namespace,
                def.listing_urls.clone(),
            )))
        }
    }
}

pub(crate) fn text_or_none(value: &str) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

/// Parse the date shapes providers publish; provider-local times are taken as UTC.
pub fn parse_due_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    const DATETIME_FORMATS: [&str; 4] = [
        "%m/%d/%Y %I:%M %p",
        "%m/%d/%Y %I:%M:%S %p",
        "%m/%d/%Y %H:%M",
        "%Y-%m-%d %H:%M:%S",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }
    for format in ["%m/%d/%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn due_dates_in_provider_formats() {
        let dt = parse_due_date("03/15/2026 02:00 PM").unwrap();
        assert_eq!((dt.month(), dt.day(), dt.hour()), (3, 15, 14));

        let date_only = parse_due_date("2026-04-01").unwrap();
        assert_eq!((date_only.month(), date_only.day()), (4, 1));

        let rfc = parse_due_date("2026-05-02T17:00:00-04:00").unwrap();
        assert_eq!(rfc.hour(), 21);

        assert_eq!(parse_due_date("TBD"), None);
        assert_eq!(parse_due_date("  "), None);
    }

    #[test]
    fn text_is_whitespace_collapsed() {
        assert_eq!(text_or_none("  Cyber \n  RFP ").as_deref(), Some("Cyber RFP"));
        assert_eq!(text_or_none("\t"), None);
    }

    #[test]
    fn json_feed_definition_requires_namespace() {
        let def = SourceDefinition {
            name: "sam-mirror".into(),
            kind: AdapterKind::JsonFeed,
            enabled: true,
            namespace: None,
            listing_urls: vec!["http://localhost/feed.json".into()],
            notes: None,
        };
        assert!(adapter_for_source(&def).is_err());
    }

    #[test]
    fn interruption_is_seen_through_fetch_errors() {
        let direct = AdapterError::from(Interrupted::Cancelled);
        assert_eq!(direct.interruption(), Some(Interrupted::Cancelled));
        let via_fetch = AdapterError::from(FetchError::Interrupted(Interrupted::DeadlineExceeded));
        assert_eq!(via_fetch.interruption(), Some(Interrupted::DeadlineExceeded));
        assert_eq!(AdapterError::Parse("x".into()).interruption(), None);
    }

    #[test]
    fn registry_entries_deserialize_from_yaml_shape() {
        let def: SourceDefinition = serde_json::from_value(serde_json::json!({
            "name": "georgia-gpr",
            "kind": "georgia-gpr",
            "listing_urls": ["https://example.gov/gpr"]
        }))
        .unwrap();
        assert!(def.enabled);
        assert_eq!(def.kind, AdapterKind::GeorgiaGpr);
        let adapter = adapter_for_source(&def).unwrap();
        assert_eq!(adapter.name(), "georgia-gpr");
    }
}
