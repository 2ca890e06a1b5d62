//! Persistence contracts consumed by the batch drivers.
//!
//! Backends live in `bdbot-storage`; drivers only see these traits.

use async_trait::async_trait;
use thiserror::Error;

use crate::{MatchResult, NewSolicitation, Score, Solicitation, User, UserSelector};

#[derive(Debug, Error)]
pub enum StoreError {
    /// The shared connection can no longer serve requests; batches abort on this.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("encoding failed: {0}")]
    Encode(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Solicitations keyed by their namespaced `source_id`.
#[async_trait]
pub trait SolicitationStore: Send + Sync {
    /// Insert, or merge the mutable fields into the row with the same `source_id`.
    ///
    /// `created_at` and `source_id` never change after the first insert;
    /// `updated_at` is refreshed on every call.
    async fn upsert(&self, listing: &NewSolicitation) -> Result<Solicitation, StoreError>;

    /// All rows, most recently created first.
    async fn list(&self) -> Result<Vec<Solicitation>, StoreError>;

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Solicitation>, StoreError>;
}

/// Match results keyed by `(user_id, solicitation_id)`, last write wins.
#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn upsert(
        &self,
        user_id: i64,
        solicitation_id: i64,
        score: Score,
        explanation: &str,
    ) -> Result<(), StoreError>;

    /// Delete every match row for `user_id`, returning how many were removed.
    async fn clear_for_user(&self, user_id: i64) -> Result<u64, StoreError>;

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<MatchResult>, StoreError>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    async fn resolve(&self, selector: &UserSelector) -> Result<Option<User>, StoreError> {
        match selector {
            UserSelector::Id(id) => self.find_by_id(*id).await,
            UserSelector::Email(email) => self.find_by_email(email).await,
        }
    }
}
