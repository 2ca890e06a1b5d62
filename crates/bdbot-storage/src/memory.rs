//! In-process stores with the same merge semantics as the Postgres backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use bdbot_core::{
    MatchResult, MatchStore, NewSolicitation, Score, Solicitation, SolicitationStore, StoreError,
    User, UserDirectory,
};
use chrono::Utc;

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".to_string())
}

#[derive(Debug, Default)]
struct SolicitationTable {
    last_id: i64,
    by_source_id: HashMap<String, Solicitation>,
}

#[derive(Debug, Default)]
pub struct MemorySolicitationStore {
    table: Mutex<SolicitationTable>,
}

impl MemorySolicitationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table
            .lock()
            .map(|t| t.by_source_id.len())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SolicitationStore for MemorySolicitationStore {
    async fn upsert(&self, listing: &NewSolicitation) -> Result<Solicitation, StoreError> {
        let mut table = self.table.lock().map_err(poisoned)?;
        let now = Utc::now();
        let next_id = table.last_id + 1;
        let row = table
            .by_source_id
            .entry(listing.source_id.clone())
            .or_insert_with(|| Solicitation {
                id: next_id,
                source_id: listing.source_id.clone(),
                title: String::new(),
                description: String::new(),
                agency: String::new(),
                due_date: None,
                url: String::new(),
                raw_data: serde_json::Value::Null,
                created_at: now,
                updated_at: now,
            });
        row.title = listing.title.clone();
        row.description = listing.description.clone();
        row.agency = listing.agency.clone();
        row.due_date = listing.due_date;
        row.url = listing.url.clone();
        row.raw_data = listing.raw_data.clone();
        row.updated_at = now;
        let stored = row.clone();
        if stored.id == next_id {
            table.last_id = next_id;
        }
        Ok(stored)
    }

    async fn list(&self) -> Result<Vec<Solicitation>, StoreError> {
        let table = self.table.lock().map_err(poisoned)?;
        let mut rows = table.by_source_id.values().cloned().collect::<Vec<_>>();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(rows)
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Solicitation>, StoreError> {
        let table = self.table.lock().map_err(poisoned)?;
        Ok(table.by_source_id.get(source_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct MemoryMatchStore {
    rows: Mutex<BTreeMap<(i64, i64), MatchResult>>,
}

impl MemoryMatchStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MatchStore for MemoryMatchStore {
    async fn upsert(
        &self,
        user_id: i64,
        solicitation_id: i64,
        score: Score,
        explanation: &str,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        rows.insert(
            (user_id, solicitation_id),
            MatchResult {
                user_id,
                solicitation_id,
                score,
                explanation: explanation.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn clear_for_user(&self, user_id: i64) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().map_err(poisoned)?;
        let before = rows.len();
        rows.retain(|(owner, _), _| *owner != user_id);
        Ok((before - rows.len()) as u64)
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<MatchResult>, StoreError> {
        let rows = self.rows.lock().map_err(poisoned)?;
        let mut out = rows
            .range((user_id, i64::MIN)..=(user_id, i64::MAX))
            .map(|(_, row)| row.clone())
            .collect::<Vec<_>>();
        out.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.solicitation_id.cmp(&b.solicitation_id))
        });
        Ok(out)
    }
}

#[derive(Debug, Default)]
pub struct MemoryUserDirectory {
    users: Mutex<Vec<User>>,
}

impl MemoryUserDirectory {
    pub fn with_users(users: impl IntoIterator<Item = User>) -> Self {
        Self {
            users: Mutex::new(users.into_iter().collect()),
        }
    }
}

#[async_trait]
impl UserDirectory for MemoryUserDirectory {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().map_err(poisoned)?;
        Ok(users.iter().find(|u| u.id == id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let users = self.users.lock().map_err(poisoned)?;
        Ok(users.iter().find(|u| u.email == email).cloned())
    }
}
