//! Version 1 of the boundary contract.
//!
//! Handlers are thin: they validate input, call into the router or the
//! context manager, and return serialisable payloads. Transport (CLI, HTTP)
//! lives outside the core.

use serde::{Deserialize, Serialize};
use tokio::task::spawn_blocking;

use crate::agents::config::{save_settings, store_secret};
use crate::agents::providers::find_seed;
use crate::agents::{AiProviderInfo, OrchestratorSettings};
use crate::aggregator::AggregatedResult;
use crate::app::AppContext;
use crate::context::routing::RoutingDecision;
use crate::db::DbPool;
use crate::errors::ChorusError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub response: String,
    pub conversation_id: String,
    pub routing: RoutingDecision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregated: Option<AggregatedResult>,
}

/// Error payload with the catalogue code and a human explanation.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub explain: String,
}

impl From<ChorusError> for ApiError {
    fn from(err: ChorusError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
            explain: err.explain().to_string(),
        }
    }
}

impl ApiError {
    fn internal(message: impl Into<String>) -> Self {
        Self {
            code: "SYS-1001".into(),
            message: message.into(),
            explain: "An internal component failed while serving the request.".into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

/// Process one user turn.
pub async fn chat(ctx: &AppContext, request: ChatRequest) -> Result<ChatReply, ApiError> {
    let conversation_id = request
        .conversation_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty());
    let outcome = ctx
        .router
        .process_message(conversation_id, &request.message)
        .await?;
    Ok(ChatReply {
        response: outcome.response,
        conversation_id: outcome.conversation_id,
        routing: outcome.routing,
        aggregated: outcome.aggregated,
    })
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreated {
    pub conversation_id: String,
    pub created_at: i64,
}

pub fn new_conversation(ctx: &AppContext) -> ConversationCreated {
    let conversation = ctx.router.contexts().create_conversation(None);
    ConversationCreated {
        conversation_id: conversation.id,
        created_at: conversation.created_at,
    }
}

/// Remove a conversation from memory and storage. Returns whether it was
/// cached.
pub fn delete_conversation(ctx: &AppContext, conversation_id: &str) -> bool {
    ctx.router.contexts().delete_conversation(conversation_id)
}

pub fn list_providers(ctx: &AppContext) -> Vec<AiProviderInfo> {
    ctx.providers().to_vec()
}

fn workspace_db(ctx: &AppContext) -> Result<DbPool, ApiError> {
    ctx.db.clone().ok_or_else(|| {
        ChorusError::InvalidInput("persistence is disabled for this session".into()).into()
    })
}

/// Store a provider API key, or remove it when `api_key` is blank.
/// Credentials are discovered once, so the change applies at next start.
pub async fn set_provider_secret(
    ctx: &AppContext,
    provider_id: &str,
    api_key: &str,
) -> Result<(), ApiError> {
    let provider_id = provider_id.trim().to_lowercase();
    if find_seed(&provider_id).is_none() {
        return Err(ChorusError::InvalidInput(format!("unknown provider: {provider_id}")).into());
    }
    let pool = workspace_db(ctx)?;
    let api_key = api_key.to_string();
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| ApiError::internal(e.to_string()))?;
        store_secret(&conn, &provider_id, &api_key).map_err(|e| ApiError::internal(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
}

/// Settings this session is running with.
pub fn get_settings(ctx: &AppContext) -> OrchestratorSettings {
    ctx.router.contexts().settings().clone()
}

/// Persist settings for the next start.
pub async fn update_settings(
    ctx: &AppContext,
    settings: OrchestratorSettings,
) -> Result<(), ApiError> {
    if settings.name.trim().is_empty() {
        return Err(ChorusError::InvalidInput("name must not be empty".into()).into());
    }
    if settings.max_messages == 0 {
        return Err(ChorusError::InvalidInput("max_messages must be at least 1".into()).into());
    }
    let pool = workspace_db(ctx)?;
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| ApiError::internal(e.to_string()))?;
        save_settings(&conn, &settings).map_err(|e| ApiError::internal(e.to_string()))
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingEvent {
    pub id: String,
    pub ts: i64,
    pub level: String,
    pub code: Option<String>,
    pub message: String,
    pub data: Option<serde_json::Value>,
}

/// Most recent routing decisions from the event log, newest first.
pub async fn list_routing_events(
    ctx: &AppContext,
    limit: Option<usize>,
) -> Result<Vec<RoutingEvent>, ApiError> {
    let Some(pool) = ctx.db.clone() else {
        return Ok(Vec::new());
    };
    let limit = limit.unwrap_or(50) as i64;
    spawn_blocking(move || {
        let conn = pool.get().map_err(|e| ApiError::internal(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, ts, level, code, message, data FROM event_log
                 WHERE module = 'chorus.routing' ORDER BY ts DESC, rowid DESC LIMIT ?1",
            )
            .map_err(|e| ApiError::internal(e.to_string()))?;
        let rows = stmt
            .query_map([limit], map_routing_event)
            .map_err(|e| ApiError::internal(e.to_string()))?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row.map_err(|e| ApiError::internal(e.to_string()))?);
        }
        Ok::<_, ApiError>(events)
    })
    .await
    .map_err(|e| ApiError::internal(e.to_string()))?
}

fn map_routing_event(row: &rusqlite::Row) -> rusqlite::Result<RoutingEvent> {
    let data_str: Option<String> = row.get(5)?;
    let data = data_str.and_then(|raw| serde_json::from_str(&raw).ok());
    Ok(RoutingEvent {
        id: row.get(0)?,
        ts: row.get(1)?,
        level: row.get(2)?,
        code: row.get(3)?,
        message: row.get(4)?,
        data,
    })
}
