//! Durable backstop for conversation state.
//!
//! Rows are overwritten wholesale on every save, so saves are idempotent.
//! Lookups of unknown keys return empty values rather than errors.

use std::collections::HashMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use r2d2_sqlite::rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use super::DbPool;
use crate::agents::ChatMessage;
use crate::context::routing::RoutingLogEntry;

/// Persisted form of a conversation's master transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub routing_log: Vec<RoutingLogEntry>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[async_trait]
pub trait ConversationStorage: Send + Sync {
    async fn save_conversation(&self, snapshot: &ConversationSnapshot) -> Result<()>;

    async fn load_conversation(&self, conversation_id: &str)
        -> Result<Option<ConversationSnapshot>>;

    async fn conversation_exists(&self, conversation_id: &str) -> Result<bool>;

    async fn save_provider_context(
        &self,
        conversation_id: &str,
        provider_id: &str,
        messages: &[ChatMessage],
    ) -> Result<()>;

    /// Empty when nothing was stored for the pair.
    async fn load_provider_context(
        &self,
        conversation_id: &str,
        provider_id: &str,
    ) -> Result<Vec<ChatMessage>>;

    async fn load_provider_contexts(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, Vec<ChatMessage>>>;

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteStorage {
    pool: DbPool,
}

impl SqliteStorage {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let conn = pool.get()?;
            work(&conn)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }
}

#[async_trait]
impl ConversationStorage for SqliteStorage {
    async fn save_conversation(&self, snapshot: &ConversationSnapshot) -> Result<()> {
        let snapshot = snapshot.clone();
        self.with_conn(move |conn| {
            let messages_json = serde_json::to_string(&snapshot.messages)?;
            let routing_json = serde_json::to_string(&snapshot.routing_log)?;
            conn.execute(
                "INSERT INTO conversations (id, messages_json, routing_log_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                     messages_json = excluded.messages_json,
                     routing_log_json = excluded.routing_log_json,
                     updated_at = excluded.updated_at",
                params![
                    snapshot.id,
                    messages_json,
                    routing_json,
                    snapshot.created_at,
                    snapshot.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<ConversationSnapshot>> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let row: Option<(String, String, i64, i64)> = conn
                .query_row(
                    "SELECT messages_json, routing_log_json, created_at, updated_at FROM conversations WHERE id = ?1",
                    params![id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
                .optional()?;
            match row {
                Some((messages_json, routing_json, created_at, updated_at)) => {
                    Ok(Some(ConversationSnapshot {
                        id,
                        messages: serde_json::from_str(&messages_json)?,
                        routing_log: serde_json::from_str(&routing_json)?,
                        created_at,
                        updated_at,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn conversation_exists(&self, conversation_id: &str) -> Result<bool> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(1) FROM conversations WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
        .await
    }

    async fn save_provider_context(
        &self,
        conversation_id: &str,
        provider_id: &str,
        messages: &[ChatMessage],
    ) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        let provider_id = provider_id.to_string();
        let messages_json = serde_json::to_string(messages)?;
        self.with_conn(move |conn| {
            let now = OffsetDateTime::now_utc().unix_timestamp();
            conn.execute(
                "INSERT INTO provider_contexts (conversation_id, provider_id, messages_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id, provider_id) DO UPDATE SET
                     messages_json = excluded.messages_json,
                     updated_at = excluded.updated_at",
                params![conversation_id, provider_id, messages_json, now],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_provider_context(
        &self,
        conversation_id: &str,
        provider_id: &str,
    ) -> Result<Vec<ChatMessage>> {
        let conversation_id = conversation_id.to_string();
        let provider_id = provider_id.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT messages_json FROM provider_contexts WHERE conversation_id = ?1 AND provider_id = ?2",
                    params![conversation_id, provider_id],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(raw) => Ok(serde_json::from_str(&raw)?),
                None => Ok(Vec::new()),
            }
        })
        .await
    }

    async fn load_provider_contexts(
        &self,
        conversation_id: &str,
    ) -> Result<HashMap<String, Vec<ChatMessage>>> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT provider_id, messages_json FROM provider_contexts WHERE conversation_id = ?1",
            )?;
            let rows = stmt.query_map(params![conversation_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut contexts = HashMap::new();
            for row in rows {
                let (provider_id, raw) = row?;
                contexts.insert(provider_id, serde_json::from_str(&raw)?);
            }
            Ok(contexts)
        })
        .await
    }

    async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let id = conversation_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM provider_contexts WHERE conversation_id = ?1",
                params![id],
            )?;
            conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }
}
