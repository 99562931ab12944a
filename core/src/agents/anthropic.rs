use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::gateway::{
    build_client, check_status, ChatMessage, ProviderDescriptor, ProviderGateway,
    ProviderResponse, RetryPolicy, Role, SendOptions,
};
use crate::errors::GatewayError;

pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

pub struct AnthropicGateway {
    descriptor: ProviderDescriptor,
    base_url: String,
    api_key: String,
    client: Client,
    retry: RetryPolicy,
}

impl AnthropicGateway {
    pub fn new(
        descriptor: ProviderDescriptor,
        api_key: String,
        base_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            descriptor,
            base_url: base_url.unwrap_or_else(|| ANTHROPIC_BASE_URL.to_string()),
            api_key,
            client: build_client()?,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn request(
        &self,
        messages: &[ChatMessage],
        options: &SendOptions,
    ) -> Result<(String, Option<u32>), GatewayError> {
        if self.api_key.trim().is_empty() {
            return Err(GatewayError::MissingCredentials(
                self.descriptor.display_name.clone(),
            ));
        }
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let (system_prompt, turns) = split_system(messages);

        let mut payload = serde_json::json!({
            "model": self.descriptor.model,
            "max_tokens": options.max_tokens,
            "messages": turns,
            "temperature": options.temperature,
        });
        if !system_prompt.is_empty() {
            payload["system"] = Value::String(system_prompt);
        }

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        let content = body
            .get("content")
            .and_then(|c| c.as_array())
            .ok_or_else(|| GatewayError::Malformed("missing content blocks".into()))?
            .iter()
            .filter_map(|part| part.get("text").and_then(|text| text.as_str()))
            .collect::<Vec<_>>()
            .join("");
        let tokens = body.get("usage").map(|usage| {
            let input = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            (input + output) as u32
        });
        Ok((content, tokens))
    }
}

#[async_trait]
impl ProviderGateway for AnthropicGateway {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send_message(
        &self,
        messages: &[ChatMessage],
        options: &SendOptions,
    ) -> ProviderResponse {
        let result = self
            .retry
            .run(&self.descriptor.id, || self.request(messages, options))
            .await;
        ProviderResponse::from_result(&self.descriptor, result)
    }
}

/// System turns travel in a separate field; the API rejects them inline.
fn split_system(messages: &[ChatMessage]) -> (String, Vec<Value>) {
    let mut system_prompt = String::new();
    let mut turns = Vec::new();
    for msg in messages {
        match msg.role {
            Role::System => {
                if !system_prompt.is_empty() {
                    system_prompt.push_str("\n\n");
                }
                system_prompt.push_str(&msg.content);
            }
            Role::User | Role::Assistant => {
                turns.push(serde_json::json!({
                    "role": msg.role.as_str(),
                    "content": [{"type": "text", "text": msg.content}],
                }));
            }
        }
    }
    (system_prompt, turns)
}
