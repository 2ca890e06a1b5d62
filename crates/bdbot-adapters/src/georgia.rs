//! Georgia Procurement Registry (GPR) open-event search.

use async_trait::async_trait;
use bdbot_core::{source_key, NewSolicitation};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde_json::{Map, Value as JsonValue};
use tracing::warn;

use crate::{parse_due_date, text_or_none, AdapterContext, AdapterError, FetchOutcome, SourceAdapter};

pub const GEORGIA_GPR_NAME: &str = "georgia-gpr";
pub const GEORGIA_NAMESPACE: &str = "ga";
pub const GEORGIA_GPR_DEFAULT_URL: &str =
    "https://ssl.doas.state.ga.us/gpr/eventSearch?eventStatus=OPEN";

/// Column positions resolved from the result table header.
#[derive(Debug, Clone, Copy)]
struct Columns {
    event_id: usize,
    title: usize,
    agency: Option<usize>,
    due: Option<usize>,
    description: Option<usize>,
}

impl Columns {
    fn from_headers(headers: &[String]) -> Self {
        let find = |needles: &[&str]| {
            headers.iter().position(|h| {
                let h = h.to_ascii_lowercase();
                needles.iter().any(|n| h.contains(n))
            })
        };
        Self {
            event_id: find(&["event id", "event number", "id"]).unwrap_or(0),
            title: find(&["title", "name"]).unwrap_or(1),
            agency: find(&["agency", "government entity", "organization"]).or(Some(2)),
            due: find(&["end date", "due", "closing", "close date"]).or(Some(3)),
            description: find(&["description", "summary"]),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeorgiaGprAdapter {
    name: String,
    namespace: String,
    listing_urls: Vec<String>,
}

impl GeorgiaGprAdapter {
    pub fn new(listing_urls: Vec<String>) -> Self {
        let listing_urls = if listing_urls.is_empty() {
            vec![GEORGIA_GPR_DEFAULT_URL.to_string()]
        } else {
            listing_urls
        };
        Self {
            name: GEORGIA_GPR_NAME.to_string(),
            namespace: GEORGIA_NAMESPACE.to_string(),
            listing_urls,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Normalize one event-search result page.
    pub fn parse_listing_html(&self, html: &str, page_url: &str) -> Result<FetchOutcome, AdapterError> {
        let document = Html::parse_document(html);
        let table_sel = selector("table#eventList, table.event-list, table")?;
        let header_sel = selector("thead th, tr th")?;
        let row_sel = selector("tbody tr")?;
        let cell_sel = selector("td")?;
        let link_sel = selector("a[href]")?;

        let Some(table) = document.select(&table_sel).next() else {
            return Err(AdapterError::Parse(format!("no event table on {page_url}")));
        };

        let headers = table
            .select(&header_sel)
            .map(|th| text_or_none(&th.text().collect::<String>()).unwrap_or_default())
            .collect::<Vec<_>>();
        let columns = Columns::from_headers(&headers);
        let base = Url::parse(page_url).ok();

        let mut outcome = FetchOutcome::default();
        for (index, row) in table.select(&row_sel).enumerate() {
            let cells = row.select(&cell_sel).collect::<Vec<_>>();
            // "No events found" placeholder rows span the whole table.
            if cells.len() <= 1 {
                continue;
            }
            let locator = format!("{page_url}#row{index}");
            let texts = cells.iter().map(cell_text).collect::<Vec<_>>();

            let Some(event_id) = texts.get(columns.event_id).cloned().flatten() else {
                outcome.skip(locator, "missing event id");
                continue;
            };
            let Some(source_id) = source_key(&self.namespace, &event_id) else {
                outcome.skip(locator, "blank event id");
                continue;
            };
            let Some(title) = texts.get(columns.title).cloned().flatten() else {
                outcome.skip(locator, format!("event {event_id} has no title"));
                continue;
            };

            let href = cells
                .get(columns.title)
                .and_then(|c| c.select(&link_sel).next())
                .or_else(|| row.select(&link_sel).next())
                .and_then(|a| a.value().attr("href"))
                .map(|href| resolve_link(base.as_ref(), href))
                .unwrap_or_default();

            let pick = |col: Option<usize>| col.and_then(|i| texts.get(i).cloned().flatten());
            let due_text = pick(columns.due);
            let due_date = due_text.as_deref().and_then(parse_due_date);
            if due_text.is_some() && due_date.is_none() {
                warn!(source = %self.name, %source_id, due = ?due_text, "unrecognized due date");
            }

            let mut raw = Map::new();
            for (i, text) in texts.iter().enumerate() {
                let key = headers
                    .get(i)
                    .filter(|h| !h.is_empty())
                    .cloned()
                    .unwrap_or_else(|| format!("column_{i}"));
                raw.insert(key, text.clone().map(JsonValue::String).unwrap_or(JsonValue::Null));
            }
            raw.insert("link".to_string(), JsonValue::String(href.clone()));
            raw.insert("page_url".to_string(), JsonValue::String(page_url.to_string()));

            outcome.listings.push(NewSolicitation {
                source_id,
                title,
                description: pick(columns.description).unwrap_or_default(),
                agency: pick(columns.agency).unwrap_or_default(),
                due_date,
                url: href,
                raw_data: JsonValue::Object(raw),
            });
        }

        Ok(outcome)
    }
}

#[async_trait]
impl SourceAdapter for GeorgiaGprAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &AdapterContext<'_>) -> Result<FetchOutcome, AdapterError> {
        let mut outcome = FetchOutcome::default();
        let mut first_error = None;
        let mut pages_ok = 0usize;

        for url in &self.listing_urls {
            ctx.run.check()?;
            let page = match ctx.http.fetch_bytes(ctx.run, &self.name, url).await {
                Ok(page) => page,
                Err(err) => {
                    let err = AdapterError::from(err);
                    if err.interruption().is_some() {
                        return Err(err);
                    }
                    outcome.skip(url.clone(), err.to_string());
                    first_error.get_or_insert(err);
                    continue;
                }
            };
            match self.parse_listing_html(&page.text(), &page.final_url) {
                Ok(parsed) => {
                    pages_ok += 1;
                    outcome.extend(parsed);
                }
                Err(err) => {
                    outcome.skip(url.clone(), err.to_string());
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) if pages_ok == 0 => Err(err),
            _ => Ok(outcome),
        }
    }
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(format!("selector {css}: {e}")))
}

fn cell_text(cell: &ElementRef<'_>) -> Option<String> {
    text_or_none(&cell.text().collect::<String>())
}

fn resolve_link(base: Option<&Url>, href: &str) -> String {
    match base.and_then(|b| b.join(href).ok()) {
        Some(url) => url.to_string(),
        None => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
        <html><body>
        <table id="eventList">
          <thead><tr><th>Event ID</th><th>Event Title</th><th>Agency</th><th>Event End Date</th></tr></thead>
          <tbody>
            <tr><td>1</td><td><a href="/gpr/event/1">A</a></td><td>DOAS</td><td>03/15/2026 02:00 PM</td></tr>
            <tr><td></td><td><a href="/gpr/event/x">Orphan</a></td><td>DOAS</td><td>03/15/2026</td></tr>
          </tbody>
        </table>
        </body></html>
    "#;

    #[test]
    fn parses_rows_and_namespaces_ids() {
        let adapter = GeorgiaGprAdapter::new(vec![]);
        let outcome = adapter
            .parse_listing_html(PAGE, "https://ssl.doas.state.ga.us/gpr/eventSearch")
            .unwrap();
        assert_eq!(outcome.listings.len(), 1);
        let first = &outcome.listings[0];
        assert_eq!(first.source_id, "ga-1");
        assert_eq!(first.title, "A");
        assert_eq!(first.agency, "DOAS");
        assert_eq!(first.url, "https://ssl.doas.state.ga.us/gpr/event/1");
        assert!(first.due_date.is_some());
        assert_eq!(first.raw_data["Event Title"], "A");

        assert!(outcome.is_partial());
        assert_eq!(outcome.item_errors[0].reason, "missing event id");
    }

    #[test]
    fn page_without_table_is_a_parse_error() {
        let adapter = GeorgiaGprAdapter::new(vec![]);
        let err = adapter
            .parse_listing_html("<html><p>maintenance</p></html>", "https://example.gov")
            .unwrap_err();
        assert!(matches!(err, AdapterError::Parse(_)));
    }
}
