//! PostgreSQL-backed offset store.
//!
//! State records live in the `consumer_offset_state` table as JSONB, one row
//! per `(kind, name)`. Idempotent creation uses `INSERT ... ON CONFLICT DO
//! NOTHING`; updates are a versioned `UPDATE ... WHERE version = $n` so a
//! lost race is detected from `rows_affected` instead of clobbering a
//! concurrent writer.
//!
//! Run the migration in `migrations/001_create_offset_state_table.sql`
//! before first use.

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::debug;

use super::{OffsetStore, StoredState};
use crate::error::{MessagingError, Result};

pub struct PostgresOffsetStore {
    pool: PgPool,
}

impl PostgresOffsetStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a store over a lazily-connecting pool; the first query opens
    /// the connection, so construction never touches the network.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| MessagingError::Configuration(format!("invalid database url: {}", e)))?;
        Ok(Self { pool })
    }

    fn key(kind: &str, name: &str) -> String {
        format!("{}/{}", kind, name)
    }
}

#[async_trait]
impl OffsetStore for PostgresOffsetStore {
    async fn load(&self, kind: &str, name: &str) -> Result<Option<StoredState>> {
        let row = sqlx::query(
            r#"
            SELECT version, state
            FROM consumer_offset_state
            WHERE kind = $1 AND name = $2
            "#,
        )
        .bind(kind)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MessagingError::persistence(Self::key(kind, name), e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row
            .try_get("version")
            .map_err(|e| MessagingError::persistence(Self::key(kind, name), e))?;
        let value: serde_json::Value = row
            .try_get("state")
            .map_err(|e| MessagingError::persistence(Self::key(kind, name), e))?;
        Ok(Some(StoredState {
            version: version as u64,
            value,
        }))
    }

    async fn try_insert(&self, kind: &str, name: &str, value: &serde_json::Value) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumer_offset_state (kind, name, version, state, updated_at)
            VALUES ($1, $2, 0, $3, NOW())
            ON CONFLICT (kind, name) DO NOTHING
            "#,
        )
        .bind(kind)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::persistence(Self::key(kind, name), e))?;

        let inserted = result.rows_affected() > 0;
        debug!(kind = %kind, name = %name, inserted, "offset state insert");
        Ok(inserted)
    }

    async fn compare_and_swap(
        &self,
        kind: &str,
        name: &str,
        expected_version: u64,
        value: &serde_json::Value,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE consumer_offset_state
            SET state = $4, version = version + 1, updated_at = NOW()
            WHERE kind = $1 AND name = $2 AND version = $3
            "#,
        )
        .bind(kind)
        .bind(name)
        .bind(expected_version as i64)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::persistence(Self::key(kind, name), e))?;

        Ok(result.rows_affected() > 0)
    }
}
