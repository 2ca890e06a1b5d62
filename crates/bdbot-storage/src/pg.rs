//! Postgres-backed stores over a shared `sqlx` pool.

use std::time::Duration;

use async_trait::async_trait;
use bdbot_core::{
    MatchResult, MatchStore, NewSolicitation, Score, Solicitation, SolicitationStore, StoreError,
    User, UserDirectory,
};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

const SOLICITATION_COLUMNS: &str = "id, source_id, title, description, agency, due_date, url, raw_data, created_at, updated_at";

/// Open the pool and ping it; any failure here is a setup failure.
pub async fn connect(database_url: &str) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(25)
        .min_connections(1)
        .max_lifetime(Duration::from_secs(5 * 60))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|err| StoreError::Unavailable(format!("connecting to database: {err}")))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|err| StoreError::Unavailable(format!("pinging database: {err}")))?;

    Ok(pool)
}

pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|err| StoreError::Query(format!("applying migrations: {err}")))
}

pub async fn server_version(pool: &PgPool) -> Result<String, StoreError> {
    let row = sqlx::query("SELECT version() AS version")
        .fetch_one(pool)
        .await
        .map_err(map_sqlx)?;
    row.try_get("version").map_err(map_sqlx)
}

fn map_sqlx(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
        _ => StoreError::Query(err.to_string()),
    }
}

fn solicitation_from_row(row: &PgRow) -> Result<Solicitation, StoreError> {
    let raw_data: Json<JsonValue> = row.try_get("raw_data").map_err(map_sqlx)?;
    Ok(Solicitation {
        id: row.try_get("id").map_err(map_sqlx)?,
        source_id: row.try_get("source_id").map_err(map_sqlx)?,
        title: row.try_get("title").map_err(map_sqlx)?,
        description: row.try_get("description").map_err(map_sqlx)?,
        agency: row.try_get("agency").map_err(map_sqlx)?,
        due_date: row.try_get("due_date").map_err(map_sqlx)?,
        url: row.try_get("url").map_err(map_sqlx)?,
        raw_data: raw_data.0,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
        updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
    })
}

#[derive(Debug, Clone)]
pub struct PgSolicitationStore {
    pool: PgPool,
}

impl PgSolicitationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SolicitationStore for PgSolicitationStore {
    async fn upsert(&self, listing: &NewSolicitation) -> Result<Solicitation, StoreError> {
        let query = format!(
            r#"
            INSERT INTO solicitations (source_id, title, description, agency, due_date, url, raw_data, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (source_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                agency = EXCLUDED.agency,
                due_date = EXCLUDED.due_date,
                url = EXCLUDED.url,
                raw_data = EXCLUDED.raw_data,
                updated_at = NOW()
            RETURNING {SOLICITATION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(&listing.source_id)
            .bind(&listing.title)
            .bind(&listing.description)
            .bind(&listing.agency)
            .bind(listing.due_date)
            .bind(&listing.url)
            .bind(Json(&listing.raw_data))
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        solicitation_from_row(&row)
    }

    async fn list(&self) -> Result<Vec<Solicitation>, StoreError> {
        let query =
            format!("SELECT {SOLICITATION_COLUMNS} FROM solicitations ORDER BY created_at DESC, id DESC");
        let rows = sqlx::query(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter().map(solicitation_from_row).collect()
    }

    async fn find_by_source_id(&self, source_id: &str) -> Result<Option<Solicitation>, StoreError> {
        let query = format!("SELECT {SOLICITATION_COLUMNS} FROM solicitations WHERE source_id = $1");
        let row = sqlx::query(&query)
            .bind(source_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        row.as_ref().map(solicitation_from_row).transpose()
    }
}

#[derive(Debug, Clone)]
pub struct PgMatchStore {
    pool: PgPool,
}

impl PgMatchStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MatchStore for PgMatchStore {
    async fn upsert(
        &self,
        user_id: i64,
        solicitation_id: i64,
        score: Score,
        explanation: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO matches (user_id, solicitation_id, score, explanation, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (user_id, solicitation_id) DO UPDATE SET
                score = EXCLUDED.score,
                explanation = EXCLUDED.explanation,
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(solicitation_id)
        .bind(i32::from(score))
        .bind(explanation)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn clear_for_user(&self, user_id: i64) -> Result<u64, StoreError> {
        let done = sqlx::query("DELETE FROM matches WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(done.rows_affected())
    }

    async fn list_by_user(&self, user_id: i64) -> Result<Vec<MatchResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT user_id::BIGINT AS user_id, solicitation_id::BIGINT AS solicitation_id,
                   score, explanation, updated_at
              FROM matches
             WHERE user_id = $1
             ORDER BY score DESC, solicitation_id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let score: i32 = row.try_get("score").map_err(map_sqlx)?;
            out.push(MatchResult {
                user_id: row.try_get("user_id").map_err(map_sqlx)?,
                solicitation_id: row.try_get("solicitation_id").map_err(map_sqlx)?,
                score: Score::clamped(f64::from(score)),
                explanation: row.try_get("explanation").map_err(map_sqlx)?,
                updated_at: row.try_get("updated_at").map_err(map_sqlx)?,
            });
        }
        Ok(out)
    }
}

/// Read-only access to the `users` table owned by the account subsystem.
#[derive(Debug, Clone)]
pub struct PgUserDirectory {
    pool: PgPool,
}

impl PgUserDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_where(&self, clause: &str, bind: UserKey<'_>) -> Result<Option<User>, StoreError> {
        let query = format!(
            "SELECT id::BIGINT AS id, email, COALESCE(full_name, '') AS full_name, \
             COALESCE(narrative, '') AS narrative FROM users WHERE {clause}"
        );
        let query = sqlx::query(&query);
        let query = match bind {
            UserKey::Id(id) => query.bind(id),
            UserKey::Email(email) => query.bind(email),
        };
        let row = query.fetch_optional(&self.pool).await.map_err(map_sqlx)?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(User {
            id: row.try_get("id").map_err(map_sqlx)?,
            email: row.try_get("email").map_err(map_sqlx)?,
            full_name: row.try_get("full_name").map_err(map_sqlx)?,
            narrative: row.try_get("narrative").map_err(map_sqlx)?,
        }))
    }
}

enum UserKey<'a> {
    Id(i64),
    Email(&'a str),
}

#[async_trait]
impl UserDirectory for PgUserDirectory {
    async fn find_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.find_where("id = $1", UserKey::Id(id)).await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        self.find_where("email = $1", UserKey::Email(email)).await
    }
}
