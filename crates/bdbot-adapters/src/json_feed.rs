//! Generic adapter for providers that publish a JSON array of listings.

use async_trait::async_trait;
use bdbot_core::{source_key, NewSolicitation};
use serde_json::Value as JsonValue;

use crate::{parse_due_date, text_or_none, AdapterContext, AdapterError, FetchOutcome, SourceAdapter};

#[derive(Debug, Clone)]
pub struct JsonFeedAdapter {
    name: String,
    namespace: String,
    urls: Vec<String>,
}

impl JsonFeedAdapter {
    pub fn new(name: &str, namespace: &str, urls: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            urls,
        }
    }

    /// Accepts a bare array or an object wrapping it under `items`/`data`/`results`.
    pub fn parse_feed(&self, body: &str, feed_url: &str) -> Result<FetchOutcome, AdapterError> {
        let value: JsonValue = serde_json::from_str(body)
            .map_err(|e| AdapterError::Parse(format!("invalid JSON from {feed_url}: {e}")))?;
        let items = match &value {
            JsonValue::Array(items) => items,
            JsonValue::Object(map) => ["items", "data", "results"]
                .iter()
                .find_map(|key| map.get(*key).and_then(JsonValue::as_array))
                .ok_or_else(|| AdapterError::Parse(format!("no listing array in {feed_url}")))?,
            _ => {
                return Err(AdapterError::Parse(format!(
                    "expected array or object from {feed_url}"
                )))
            }
        };

        let mut outcome = FetchOutcome::default();
        for (index, item) in items.iter().enumerate() {
            let locator = format!("{feed_url}[{index}]");
            if !item.is_object() {
                outcome.skip(locator, "listing is not an object");
                continue;
            }
            let Some(local_id) = id_text(item.get("id")) else {
                outcome.skip(locator, "missing id");
                continue;
            };
            let Some(source_id) = source_key(&self.namespace, &local_id) else {
                outcome.skip(locator, "blank id");
                continue;
            };
            let Some(title) = str_field(item, "title") else {
                outcome.skip(locator, format!("listing {local_id} has no title"));
                continue;
            };

            outcome.listings.push(NewSolicitation {
                source_id,
                title,
                description: str_field(item, "description").unwrap_or_default(),
                agency: str_field(item, "agency").unwrap_or_default(),
                due_date: str_field(item, "due_date").as_deref().and_then(parse_due_date),
                url: str_field(item, "url").unwrap_or_default(),
                raw_data: item.clone(),
            });
        }
        Ok(outcome)
    }
}

fn id_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(s) => text_or_none(s),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn str_field(item: &JsonValue, key: &str) -> Option<String> {
    item.get(key).and_then(JsonValue::as_str).and_then(text_or_none)
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        let mut outcome = FetchOutcome::default();
        let mut last_error = None;
        let mut feeds_ok = 0usize;

        for url in &self.urls {
            ctx.run.check()?;
            let parsed = match ctx.http.fetch_bytes(ctx.run, &self.name, url).await {
                Ok(resp) => self.parse_feed(&resp.text(), url),
                Err(bdbot_storage::FetchError::Interrupted(reason)) => return Err(reason.into()),
                Err(err) => Err(err.into()),
            };
            match parsed {
                Ok(parsed) => {
                    feeds_ok += 1;
                    outcome.extend(parsed);
                }
                Err(err) => {
                    outcome.skip(url.clone(), err.to_string());
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if feeds_ok == 0 => Err(err),
            _ => Ok(outcome),
        }
    }
}
