//! Uniform capability contract over the external AI services.
//!
//! Every vendor integration implements [`ProviderGateway`]. A gateway never
//! returns an error to its caller: transport, status and decoding failures
//! are folded into [`ProviderResponse::error`] so that a fan-out can always
//! produce one entry per requested provider.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::errors::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Static identity of a configured provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub display_name: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    /// Accepted for contract compatibility; gateways always answer in one piece.
    pub stream: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub provider: ProviderDescriptor,
    pub content: String,
    pub error: Option<String>,
    pub timestamp: i64,
    pub tokens: Option<u32>,
}

impl ProviderResponse {
    pub fn success(provider: ProviderDescriptor, content: String, tokens: Option<u32>) -> Self {
        Self {
            provider,
            content,
            error: None,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            tokens,
        }
    }

    pub fn failure(provider: ProviderDescriptor, error: impl Into<String>) -> Self {
        Self {
            provider,
            content: String::new(),
            error: Some(error.into()),
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
            tokens: None,
        }
    }

    pub fn from_result(
        provider: &ProviderDescriptor,
        result: Result<(String, Option<u32>), GatewayError>,
    ) -> Self {
        match result {
            Ok((content, tokens)) => Self::success(provider.clone(), content, tokens),
            Err(err) => {
                tracing::warn!(
                    "provider {} failed ({}): {}",
                    provider.id,
                    err.code(),
                    err
                );
                Self::failure(provider.clone(), err.to_string())
            }
        }
    }

    /// Non-empty content and no error.
    pub fn is_valid(&self) -> bool {
        self.error.is_none() && !self.content.trim().is_empty()
    }
}

#[async_trait]
pub trait ProviderGateway: Send + Sync {
    fn descriptor(&self) -> &ProviderDescriptor;

    async fn send_message(&self, messages: &[ChatMessage], options: &SendOptions)
        -> ProviderResponse;

    fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| approx_tokens(&m.content)).sum()
    }
}

/// Estimate tokens using a simple character based heuristic.
pub fn approx_tokens(text: &str) -> usize {
    let chars = text.chars().count() as f32;
    let words = text.split_whitespace().count() as f32;
    let char_est = (chars / 4.0).ceil();
    let word_est = (words * 1.1).ceil();
    char_est.max(word_est).max(1.0) as usize
}

/// Bounded retry applied only to transient overload failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before the given retry (1-based): grows linearly per attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    pub async fn run<F, Fut, T>(&self, provider_id: &str, mut call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Err(err) if err.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::info!(
                        "provider {provider_id} overloaded, retrying in {}ms (attempt {}/{})",
                        delay.as_millis(),
                        attempt + 1,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// HTTP client owned by a single gateway; the timeout is per call.
pub(crate) fn build_client() -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .timeout(Duration::from_secs(45))
        .user_agent("Chorus-Core/0.1")
        .build()
        .context("failed to construct HTTP client")
}

/// Turn a non-success HTTP status into a [`GatewayError::Http`].
pub(crate) async fn check_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Http {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    })
}
