use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, Row};
use std::time::Duration;
use uuid::Uuid;

use crate::error::StoreError;

pub type DbPool = Pool<Postgres>;

/// Actions a caller can be authorized for on a poll. The real permission
/// model lives outside this service; we only consume a boolean check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    View,
    Vote,
}

/// The authoritative store, as seen by the vote pipeline. The Postgres
/// implementation is below; tests swap in an in-memory one.
#[async_trait]
pub trait PollStore: Send + Sync {
    async fn authorize(
        &self,
        user_id: Option<Uuid>,
        poll_id: Uuid,
        permission: Permission,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Current vote counts for every option of the poll, zero-filled for
    /// options nobody has voted for, ordered by option id.
    async fn read_vote_counts(&self, poll_id: Uuid) -> Result<Vec<(Uuid, i64)>, StoreError>;

    /// Atomically replace the user's active vote on the poll with a new one.
    /// Returns the option the replaced vote was for, if there was one.
    async fn write_vote_transaction(
        &self,
        poll_id: Uuid,
        user_id: Uuid,
        option_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError>;

    async fn option_belongs_to_poll(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
    ) -> Result<bool, StoreError>;
}

pub async fn init_db(database_url: &str) -> Result<DbPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .max_lifetime(Duration::from_secs(30 * 60))
        .idle_timeout(Duration::from_secs(10 * 60))
        .connect(database_url)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            username VARCHAR(255) NOT NULL UNIQUE,
            created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS polls (
            id UUID PRIMARY KEY,
            creator_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            title VARCHAR(255) NOT NULL,
            description TEXT,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
            expires_at TIMESTAMP WITH TIME ZONE,
            closed BOOLEAN NOT NULL DEFAULT FALSE
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS poll_options (
            id UUID PRIMARY KEY,
            poll_id UUID NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
            option_text VARCHAR(255) NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS votes (
            id UUID PRIMARY KEY,
            poll_id UUID NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
            option_id UUID NOT NULL REFERENCES poll_options(id) ON DELETE CASCADE,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            created_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(poll_id, user_id)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_poll_options_poll_id ON poll_options(poll_id)
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_votes_poll_id ON votes(poll_id)
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_votes_user_id ON votes(user_id)
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

pub struct PgPollStore {
    pool: DbPool,
}

impl PgPollStore {
    pub fn new(pool: DbPool) -> Self {
        PgPollStore { pool }
    }
}

#[async_trait]
impl PollStore for PgPollStore {
    async fn authorize(
        &self,
        _user_id: Option<Uuid>,
        poll_id: Uuid,
        permission: Permission,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT closed, expires_at FROM polls WHERE id = $1")
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        let Some(row) = row else {
            return Ok(false);
        };

        match permission {
            Permission::View => Ok(true),
            Permission::Vote => {
                let closed: bool = row.get("closed");
                let expires_at: Option<DateTime<Utc>> = row.get("expires_at");
                Ok(!closed && expires_at.map_or(true, |t| t > at))
            }
        }
    }

    async fn read_vote_counts(&self, poll_id: Uuid) -> Result<Vec<(Uuid, i64)>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT po.id AS option_id, COUNT(v.id) AS vote_count
            FROM poll_options po
            LEFT JOIN votes v ON v.option_id = po.id
            WHERE po.poll_id = $1
            GROUP BY po.id
            ORDER BY po.id
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|r| (r.get::<Uuid, _>("option_id"), r.get::<i64, _>("vote_count")))
            .collect())
    }

    async fn write_vote_transaction(
        &self,
        poll_id: Uuid,
        user_id: Uuid,
        option_id: Uuid,
    ) -> Result<Option<Uuid>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let previous = sqlx::query(
            "DELETE FROM votes WHERE poll_id = $1 AND user_id = $2 RETURNING option_id",
        )
        .bind(poll_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .map(|r| r.get::<Uuid, _>("option_id"));

        sqlx::query("INSERT INTO votes (id, poll_id, option_id, user_id) VALUES ($1, $2, $3, $4)")
            .bind(Uuid::new_v4())
            .bind(poll_id)
            .bind(option_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(previous)
    }

    async fn option_belongs_to_poll(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM poll_options WHERE id = $1 AND poll_id = $2")
            .bind(option_id)
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;

        Ok(row.is_some())
    }
}
