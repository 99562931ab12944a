//! Provider credentials and orchestrator settings.
//!
//! Credentials are discovered once at startup: the provider's environment
//! variable wins, then the `ai_credentials` table. Providers without a
//! credential are left out of the fan-out without raising an error.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::anthropic::AnthropicGateway;
use super::gateway::{ProviderDescriptor, ProviderGateway};
use super::gemini::GeminiGateway;
use super::openai::OpenAiGateway;
use super::providers::{ProviderKind, ProviderSeed, PROVIDER_SEEDS};
use crate::logging::log_event;

const SETTINGS_KEY: &str = "orchestrator.settings";

#[derive(Debug, Clone, Serialize)]
pub struct AiProviderInfo {
    pub id: String,
    pub display_name: String,
    pub description: String,
    pub model: String,
    pub has_credentials: bool,
}

/// A provider whose credential was found.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub seed: &'static ProviderSeed,
    pub secret: String,
}

impl ProviderCredential {
    pub fn descriptor(&self) -> ProviderDescriptor {
        ProviderDescriptor {
            id: self.seed.id.to_string(),
            display_name: self.seed.display.to_string(),
            model: self.seed.default_model.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub name: String,
    pub max_messages: usize,
    pub routing_history: usize,
    pub default_provider: String,
    pub classifier_provider: String,
    pub synthesis_provider: String,
    pub classifier_temperature: f32,
    pub self_reference_keywords: Vec<String>,
    pub persist: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            name: "Chorus".into(),
            max_messages: 20,
            routing_history: 6,
            default_provider: "openai".into(),
            classifier_provider: "openai".into(),
            synthesis_provider: "openai".into(),
            classifier_temperature: 0.1,
            self_reference_keywords: vec![
                "chorus".into(),
                "mean answer".into(),
                "mean value".into(),
                "best answer".into(),
            ],
            persist: true,
        }
    }
}

impl OrchestratorSettings {
    /// Pick `preferred` when it is available, otherwise the first available id.
    pub fn resolve_provider<'a>(&self, preferred: &str, available: &'a [String]) -> Option<&'a str> {
        available
            .iter()
            .find(|id| id.as_str() == preferred)
            .or_else(|| available.first())
            .map(|id| id.as_str())
    }
}

/// Discover credentials using `lookup` for environment values and the
/// optional database for stored secrets.
pub fn discover_credentials<F>(
    conn: Option<&rusqlite::Connection>,
    lookup: F,
) -> Result<Vec<ProviderCredential>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut found = Vec::new();
    for seed in PROVIDER_SEEDS {
        let from_env = lookup(seed.env_key).filter(|v| !v.trim().is_empty());
        let secret = match from_env {
            Some(secret) => Some(secret),
            None => match conn {
                Some(conn) => load_secret(conn, seed.id)?,
                None => None,
            },
        };
        if let Some(secret) = secret {
            found.push(ProviderCredential {
                seed,
                secret: secret.trim().to_string(),
            });
        }
    }
    Ok(found)
}

/// Build one gateway per discovered credential, in catalogue order.
pub fn build_gateways(credentials: &[ProviderCredential]) -> Result<Vec<Arc<dyn ProviderGateway>>> {
    let mut gateways: Vec<Arc<dyn ProviderGateway>> = Vec::new();
    for cred in credentials {
        let descriptor = cred.descriptor();
        let base_url = cred.seed.base_url.map(str::to_string);
        let gateway: Arc<dyn ProviderGateway> = match cred.seed.kind {
            ProviderKind::OpenAi => {
                Arc::new(OpenAiGateway::new(descriptor, cred.secret.clone(), base_url)?)
            }
            ProviderKind::Anthropic => {
                Arc::new(AnthropicGateway::new(descriptor, cred.secret.clone(), base_url)?)
            }
            ProviderKind::Gemini => {
                Arc::new(GeminiGateway::new(descriptor, cred.secret.clone(), base_url)?)
            }
        };
        gateways.push(gateway);
    }
    Ok(gateways)
}

/// Catalogue view marking which providers are available, for listing in a UI.
pub fn list_providers(available: &[String]) -> Vec<AiProviderInfo> {
    PROVIDER_SEEDS
        .iter()
        .map(|seed| AiProviderInfo {
            id: seed.id.to_string(),
            display_name: seed.display.to_string(),
            description: seed.description.to_string(),
            model: seed.default_model.to_string(),
            has_credentials: available.iter().any(|id| id == seed.id),
        })
        .collect()
}

pub fn store_secret(conn: &rusqlite::Connection, provider_id: &str, api_key: &str) -> Result<()> {
    if super::providers::find_seed(provider_id).is_none() {
        return Err(anyhow!("Unknown AI provider: {provider_id}"));
    }
    let trimmed = api_key.trim();
    if trimmed.is_empty() {
        conn.execute(
            "DELETE FROM ai_credentials WHERE provider_id = ?1",
            params![provider_id],
        )?;
    } else {
        let encoded = B64_ENGINE.encode(trimmed.as_bytes());
        let now = OffsetDateTime::now_utc().unix_timestamp();
        conn.execute(
            "INSERT INTO ai_credentials (provider_id, secret, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(provider_id) DO UPDATE SET secret = excluded.secret, updated_at = excluded.updated_at",
            params![provider_id, encoded, now],
        )?;
    }
    let _ = log_event(
        conn,
        "info",
        Some("AI-0001"),
        "chorus.settings",
        "Provider credential updated",
        Some("Takes effect at next start"),
        Some(serde_json::json!({ "provider": provider_id })),
    );
    Ok(())
}

fn load_secret(conn: &rusqlite::Connection, provider_id: &str) -> Result<Option<String>> {
    let secret: Option<String> = conn
        .query_row(
            "SELECT secret FROM ai_credentials WHERE provider_id = ?1",
            params![provider_id],
            |row| row.get(0),
        )
        .optional()?;

    if let Some(s) = secret {
        let decoded = B64_ENGINE
            .decode(s.as_bytes())
            .map_err(|_| anyhow!("Failed to decode stored credential"))?;
        let value = String::from_utf8(decoded)
            .map_err(|_| anyhow!("Stored credential was not valid UTF-8"))?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}

pub fn load_settings(conn: &rusqlite::Connection) -> Result<OrchestratorSettings> {
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![SETTINGS_KEY],
            |row| row.get(0),
        )
        .optional()?;
    match value {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(OrchestratorSettings::default()),
    }
}

pub fn save_settings(conn: &rusqlite::Connection, settings: &OrchestratorSettings) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let payload = serde_json::to_string(settings)?;
    conn.execute(
        "INSERT INTO app_settings (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![SETTINGS_KEY, payload, now],
    )?;
    Ok(())
}
