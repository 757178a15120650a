//! Durable L2 store backed by SQLite with WAL enabled, mirroring
//! `querymt::session::sqlite::SqliteSessionStore`'s pool-per-handle,
//! migrate-on-`new()` shape. Schema per spec §6.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use super::types::{SessionSignatureEntry, SignatureEntry, ToolSignatureEntry};
use crate::error::{GatewayError, Result};

pub struct SqliteSignatureStore {
    pool: SqlitePool,
}

impl SqliteSignatureStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        // A single connection keeps an `sqlite::memory:` URL consistent across
        // queries in tests, and is sufficient here since writes already
        // serialize through the AsyncWriteQueue's single consumer task.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to open L2 cache db: {e}")))?;

        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("failed to set WAL mode: {e}")))?;

        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS signature_cache (
                cache_key TEXT PRIMARY KEY NOT NULL,
                thinking_hash TEXT NOT NULL,
                signature TEXT NOT NULL,
                thinking_prefix TEXT NOT NULL,
                model TEXT NOT NULL,
                namespace TEXT NOT NULL,
                conversation_id TEXT,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                last_accessed_at TEXT NOT NULL,
                metadata_json TEXT
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to create signature_cache: {e}")))?;

        for (name, sql) in [
            (
                "idx_signature_cache_thinking_hash",
                "CREATE INDEX IF NOT EXISTS idx_signature_cache_thinking_hash ON signature_cache(thinking_hash);",
            ),
            (
                "idx_signature_cache_namespace",
                "CREATE INDEX IF NOT EXISTS idx_signature_cache_namespace ON signature_cache(namespace);",
            ),
            (
                "idx_signature_cache_conversation_id",
                "CREATE INDEX IF NOT EXISTS idx_signature_cache_conversation_id ON signature_cache(conversation_id);",
            ),
            (
                "idx_signature_cache_expires_at",
                "CREATE INDEX IF NOT EXISTS idx_signature_cache_expires_at ON signature_cache(expires_at);",
            ),
        ] {
            sqlx::query(sql)
                .execute(pool)
                .await
                .map_err(|e| GatewayError::Internal(format!("failed to create {name}: {e}")))?;
        }

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tool_signature_cache (
                tool_id TEXT PRIMARY KEY NOT NULL,
                signature TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to create tool_signature_cache: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS session_signature_cache (
                session_id TEXT PRIMARY KEY NOT NULL,
                signature TEXT NOT NULL,
                thinking_text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| {
            GatewayError::Internal(format!("failed to create session_signature_cache: {e}"))
        })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS conversation_state (
                scid TEXT PRIMARY KEY NOT NULL,
                client_type TEXT NOT NULL,
                authoritative_history_json TEXT NOT NULL,
                last_signature TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to create conversation_state: {e}")))?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn get(&self, cache_key: &str) -> Result<Option<SignatureEntry>> {
        let row = sqlx::query("SELECT * FROM signature_cache WHERE cache_key = ?")
            .bind(cache_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_entry).transpose()
    }

    /// Fallback lookup by thinking_hash alone, ignoring namespace (spec
    /// §4.1 "fallback lookup by hash alone" — flagged cross-conversation
    /// reuse risk recorded in DESIGN.md).
    pub async fn get_by_hash_any_namespace(
        &self,
        thinking_hash: &str,
    ) -> Result<Option<SignatureEntry>> {
        let row = sqlx::query(
            "SELECT * FROM signature_cache WHERE thinking_hash = ? ORDER BY last_accessed_at DESC LIMIT 1",
        )
        .bind(thinking_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Self::row_to_entry).transpose()
    }

    pub async fn get_most_recent(&self) -> Result<Option<SignatureEntry>> {
        let row = sqlx::query("SELECT * FROM signature_cache ORDER BY last_accessed_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_entry).transpose()
    }

    pub async fn set(&self, entry: &SignatureEntry) -> Result<()> {
        let cache_key = entry.cache_key().as_string();
        sqlx::query(
            "INSERT INTO signature_cache
                (cache_key, thinking_hash, signature, thinking_prefix, model, namespace,
                 conversation_id, created_at, expires_at, access_count, last_accessed_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(cache_key) DO UPDATE SET
                signature = excluded.signature,
                expires_at = excluded.expires_at,
                access_count = excluded.access_count,
                last_accessed_at = excluded.last_accessed_at",
        )
        .bind(&cache_key)
        .bind(&entry.thinking_hash)
        .bind(&entry.signature)
        .bind(&entry.thinking_prefix)
        .bind(&entry.model)
        .bind(&entry.namespace)
        .bind(&entry.conversation_id)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.expires_at.to_rfc3339())
        .bind(entry.access_count as i64)
        .bind(entry.last_accessed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, cache_key: &str) -> Result<()> {
        sqlx::query("DELETE FROM signature_cache WHERE cache_key = ?")
            .bind(cache_key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn clear(&self, namespace: Option<&str>, conversation_id: Option<&str>) -> Result<()> {
        match (namespace, conversation_id) {
            (Some(ns), Some(conv)) => {
                sqlx::query("DELETE FROM signature_cache WHERE namespace = ? AND conversation_id = ?")
                    .bind(ns)
                    .bind(conv)
                    .execute(&self.pool)
                    .await?;
            }
            (Some(ns), None) => {
                sqlx::query("DELETE FROM signature_cache WHERE namespace = ?")
                    .bind(ns)
                    .execute(&self.pool)
                    .await?;
            }
            _ => {
                sqlx::query("DELETE FROM signature_cache").execute(&self.pool).await?;
            }
        }
        Ok(())
    }

    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM signature_cache WHERE expires_at <= ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn tool_get(&self, tool_id: &str) -> Result<Option<ToolSignatureEntry>> {
        let row = sqlx::query("SELECT * FROM tool_signature_cache WHERE tool_id = ?")
            .bind(tool_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_tool_entry).transpose()
    }

    pub async fn tool_set(&self, entry: &ToolSignatureEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO tool_signature_cache (tool_id, signature, created_at, expires_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tool_id) DO UPDATE SET signature = excluded.signature, expires_at = excluded.expires_at",
        )
        .bind(&entry.tool_id)
        .bind(&entry.signature)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session_get(&self, session_id: &str) -> Result<Option<SessionSignatureEntry>> {
        let row = sqlx::query("SELECT * FROM session_signature_cache WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_session_entry).transpose()
    }

    pub async fn session_set(&self, entry: &SessionSignatureEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO session_signature_cache (session_id, signature, thinking_text, created_at, expires_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET
                signature = excluded.signature,
                thinking_text = excluded.thinking_text,
                expires_at = excluded.expires_at",
        )
        .bind(&entry.session_id)
        .bind(&entry.signature)
        .bind(&entry.thinking_text)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conversation_get(&self, scid: &str) -> Result<Option<crate::conversation::ConversationRecord>> {
        let row = sqlx::query("SELECT * FROM conversation_state WHERE scid = ?")
            .bind(scid)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_conversation_record).transpose()
    }

    pub async fn conversation_set(&self, record: &crate::conversation::ConversationRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversation_state
                (scid, client_type, authoritative_history_json, last_signature,
                 created_at, updated_at, expires_at, access_count)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(scid) DO UPDATE SET
                client_type = excluded.client_type,
                authoritative_history_json = excluded.authoritative_history_json,
                last_signature = excluded.last_signature,
                updated_at = excluded.updated_at,
                expires_at = excluded.expires_at,
                access_count = excluded.access_count",
        )
        .bind(&record.scid)
        .bind(&record.client_type)
        .bind(&record.authoritative_history_json)
        .bind(&record.last_signature)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.expires_at.to_rfc3339())
        .bind(record.access_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn conversation_delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM conversation_state WHERE expires_at <= ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn row_to_conversation_record(
        row: sqlx::sqlite::SqliteRow,
    ) -> Result<crate::conversation::ConversationRecord> {
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let expires_at: String = row.try_get("expires_at")?;
        Ok(crate::conversation::ConversationRecord {
            scid: row.try_get("scid")?,
            client_type: row.try_get("client_type")?,
            authoritative_history_json: row.try_get("authoritative_history_json")?,
            last_signature: row.try_get("last_signature")?,
            created_at: parse_rfc3339(&created_at)?,
            updated_at: parse_rfc3339(&updated_at)?,
            expires_at: parse_rfc3339(&expires_at)?,
            access_count: row.try_get("access_count")?,
        })
    }

    fn row_to_entry(row: sqlx::sqlite::SqliteRow) -> Result<SignatureEntry> {
        let created_at: String = row.try_get("created_at")?;
        let expires_at: String = row.try_get("expires_at")?;
        let last_accessed_at: String = row.try_get("last_accessed_at")?;
        Ok(SignatureEntry {
            signature: row.try_get("signature")?,
            thinking_hash: row.try_get("thinking_hash")?,
            thinking_prefix: row.try_get("thinking_prefix")?,
            model: row.try_get("model")?,
            namespace: row.try_get("namespace")?,
            conversation_id: row.try_get("conversation_id")?,
            created_at: parse_rfc3339(&created_at)?,
            expires_at: parse_rfc3339(&expires_at)?,
            last_accessed_at: parse_rfc3339(&last_accessed_at)?,
            access_count: row.try_get::<i64, _>("access_count")? as u64,
        })
    }

    fn row_to_tool_entry(row: sqlx::sqlite::SqliteRow) -> Result<ToolSignatureEntry> {
        let created_at: String = row.try_get("created_at")?;
        let expires_at: String = row.try_get("expires_at")?;
        Ok(ToolSignatureEntry {
            tool_id: row.try_get("tool_id")?,
            signature: row.try_get("signature")?,
            created_at: parse_rfc3339(&created_at)?,
            expires_at: parse_rfc3339(&expires_at)?,
        })
    }

    fn row_to_session_entry(row: sqlx::sqlite::SqliteRow) -> Result<SessionSignatureEntry> {
        let created_at: String = row.try_get("created_at")?;
        let expires_at: String = row.try_get("expires_at")?;
        Ok(SessionSignatureEntry {
            session_id: row.try_get("session_id")?,
            signature: row.try_get("signature")?,
            thinking_text: row.try_get("thinking_text")?,
            created_at: parse_rfc3339(&created_at)?,
            expires_at: parse_rfc3339(&expires_at)?,
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| GatewayError::Internal(format!("bad timestamp in cache row: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> SqliteSignatureStore {
        SqliteSignatureStore::new("sqlite::memory:").await.unwrap()
    }

    fn sample_entry() -> SignatureEntry {
        let now = Utc::now();
        SignatureEntry {
            signature: "A".repeat(60),
            thinking_hash: "hash1".into(),
            thinking_prefix: "Let me think".into(),
            model: "claude-sonnet-4.5".into(),
            namespace: "ns1".into(),
            conversation_id: Some("conv1".into()),
            created_at: now,
            expires_at: now + Duration::hours(1),
            last_accessed_at: now,
            access_count: 0,
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = store().await;
        let entry = sample_entry();
        store.set(&entry).await.unwrap();
        let fetched = store.get(&entry.cache_key().as_string()).await.unwrap().unwrap();
        assert_eq!(fetched.signature, entry.signature);
    }

    #[tokio::test]
    async fn get_by_hash_any_namespace_finds_entry() {
        let store = store().await;
        let entry = sample_entry();
        store.set(&entry).await.unwrap();
        let found = store.get_by_hash_any_namespace("hash1").await.unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn sweep_expired_removes_past_entries() {
        let store = store().await;
        let mut entry = sample_entry();
        entry.expires_at = Utc::now() - Duration::seconds(1);
        store.set(&entry).await.unwrap();
        let removed = store.sweep_expired(Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&entry.cache_key().as_string()).await.unwrap().is_none());
    }
}
