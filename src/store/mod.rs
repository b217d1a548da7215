/// Persistent conversation records.
///
/// One row per (scope, client-visible conversation id); secondary lookups by
/// history hash, expiry, and credential token. Readers purge expired rows on
/// the way, so nothing past its `expires_at` is ever returned. Writers go
/// through `INSERT … ON CONFLICT` so concurrent upserts stay per-row atomic.
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::error::GatewayError;

/// Upper bound on one expired-row cleanup pass.
const CLEANUP_LIMIT_MAX: u32 = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub scope: String,
    pub openai_conversation_id: String,
    pub grok_conversation_id: String,
    pub last_response_id: String,
    pub share_link_id: String,
    pub token: String,
    pub history_hash: String,
    /// Epoch milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct TokenCount {
    /// Last six characters of the credential token, enough to tell
    /// accounts apart without exposing the fingerprint.
    pub token_suffix: String,
    pub count: i64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub active_total: i64,
    pub expired_total: i64,
    pub top_tokens: Vec<TokenCount>,
}

pub struct ConversationStore {
    pool: SqlitePool,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS conversations (
    scope TEXT NOT NULL,
    openai_conversation_id TEXT NOT NULL,
    grok_conversation_id TEXT NOT NULL,
    last_response_id TEXT NOT NULL,
    share_link_id TEXT NOT NULL DEFAULT '',
    token TEXT NOT NULL,
    history_hash TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL,
    PRIMARY KEY (scope, openai_conversation_id)
);
CREATE INDEX IF NOT EXISTS idx_conversations_history
    ON conversations (scope, history_hash);
CREATE INDEX IF NOT EXISTS idx_conversations_expiry
    ON conversations (scope, expires_at);
CREATE INDEX IF NOT EXISTS idx_conversations_token
    ON conversations (scope, token, updated_at);
";

fn row_from_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<ConversationRow, sqlx::Error> {
    Ok(ConversationRow {
        scope: row.try_get("scope")?,
        openai_conversation_id: row.try_get("openai_conversation_id")?,
        grok_conversation_id: row.try_get("grok_conversation_id")?,
        last_response_id: row.try_get("last_response_id")?,
        share_link_id: row.try_get("share_link_id")?,
        token: row.try_get("token")?,
        history_hash: row.try_get("history_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

impl ConversationStore {
    /// Open (creating if missing) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] when the database cannot be opened
    /// or the schema cannot be applied.
    pub async fn connect(path: &str) -> Result<Self, GatewayError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| GatewayError::Internal(format!("create store dir: {err}")))?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Self::init(pool).await
    }

    /// In-memory store, used by tests.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] when the pool cannot be created.
    pub async fn connect_in_memory() -> Result<Self, GatewayError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init(pool).await
    }

    async fn init(pool: SqlitePool) -> Result<Self, GatewayError> {
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert or replace by (`scope`, `openai_conversation_id`), updating
    /// every mutable field atomically.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn upsert(&self, row: &ConversationRow) -> Result<(), GatewayError> {
        sqlx::query(
            "INSERT INTO conversations (scope, openai_conversation_id, grok_conversation_id,
                last_response_id, share_link_id, token, history_hash,
                created_at, updated_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (scope, openai_conversation_id) DO UPDATE SET
                grok_conversation_id = excluded.grok_conversation_id,
                last_response_id = excluded.last_response_id,
                share_link_id = excluded.share_link_id,
                token = excluded.token,
                history_hash = excluded.history_hash,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at",
        )
        .bind(&row.scope)
        .bind(&row.openai_conversation_id)
        .bind(&row.grok_conversation_id)
        .bind(&row.last_response_id)
        .bind(&row.share_link_id)
        .bind(&row.token)
        .bind(&row.history_hash)
        .bind(row.created_at)
        .bind(row.updated_at)
        .bind(row.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one live row, purging it first if it expired.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn get_by_id(
        &self,
        scope: &str,
        openai_conversation_id: &str,
        now: i64,
    ) -> Result<Option<ConversationRow>, GatewayError> {
        sqlx::query(
            "DELETE FROM conversations
             WHERE scope = ?1 AND openai_conversation_id = ?2 AND expires_at <= ?3",
        )
        .bind(scope)
        .bind(openai_conversation_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM conversations
             WHERE scope = ?1 AND openai_conversation_id = ?2",
        )
        .bind(scope)
        .bind(openai_conversation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_from_sqlite).transpose().map_err(Into::into)
    }

    /// Newest live row in scope matching the history hash, after purging
    /// the scope's expired rows. An empty hash never matches.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn find_by_history_hash(
        &self,
        scope: &str,
        history_hash: &str,
        now: i64,
    ) -> Result<Option<ConversationRow>, GatewayError> {
        if history_hash.is_empty() {
            return Ok(None);
        }

        sqlx::query("DELETE FROM conversations WHERE scope = ?1 AND expires_at <= ?2")
            .bind(scope)
            .bind(now)
            .execute(&self.pool)
            .await?;

        let row = sqlx::query(
            "SELECT * FROM conversations
             WHERE scope = ?1 AND history_hash = ?2
             ORDER BY updated_at DESC
             LIMIT 1",
        )
        .bind(scope)
        .bind(history_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_from_sqlite).transpose().map_err(Into::into)
    }

    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn delete_by_id(
        &self,
        scope: &str,
        openai_conversation_id: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            "DELETE FROM conversations WHERE scope = ?1 AND openai_conversation_id = ?2",
        )
        .bind(scope)
        .bind(openai_conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete up to `limit` (clamped to 1..=500) expired rows, oldest
    /// first. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn cleanup_expired(&self, limit: u32, now: i64) -> Result<u64, GatewayError> {
        let limit = limit.clamp(1, CLEANUP_LIMIT_MAX);
        let result = sqlx::query(
            "DELETE FROM conversations
             WHERE rowid IN (
                SELECT rowid FROM conversations
                WHERE expires_at <= ?1
                ORDER BY expires_at ASC
                LIMIT ?2
             )",
        )
        .bind(now)
        .bind(i64::from(limit))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Keep the `keep` most recently updated rows for (scope, token),
    /// deleting the rest. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn trim_for_token(
        &self,
        scope: &str,
        token: &str,
        keep: u32,
    ) -> Result<u64, GatewayError> {
        let result = sqlx::query(
            "DELETE FROM conversations
             WHERE scope = ?1 AND token = ?2 AND rowid NOT IN (
                SELECT rowid FROM conversations
                WHERE scope = ?1 AND token = ?2
                ORDER BY updated_at DESC
                LIMIT ?3
             )",
        )
        .bind(scope)
        .bind(token)
        .bind(i64::from(keep))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Live/expired row counts plus the busiest credential tokens.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Store`] on database failure.
    pub async fn stats(&self, top_n: u32, now: i64) -> Result<StoreStats, GatewayError> {
        let active_total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE expires_at > ?1")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;
        let expired_total: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM conversations WHERE expires_at <= ?1")
                .bind(now)
                .fetch_one(&self.pool)
                .await?;

        let rows = sqlx::query(
            "SELECT token, COUNT(*) AS count FROM conversations
             WHERE expires_at > ?1
             GROUP BY token
             ORDER BY count DESC
             LIMIT ?2",
        )
        .bind(now)
        .bind(i64::from(top_n.max(1)))
        .fetch_all(&self.pool)
        .await?;

        let top_tokens = rows
            .iter()
            .map(|row| {
                let token: String = row.try_get("token")?;
                let count: i64 = row.try_get("count")?;
                let suffix_start = token.len().saturating_sub(6);
                Ok(TokenCount {
                    token_suffix: token[suffix_start..].to_string(),
                    count,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(StoreStats {
            active_total,
            expired_total,
            top_tokens,
        })
    }
}
