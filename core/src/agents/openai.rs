use anyhow::Result;
use reqwest::Client;
use serde_json::Value;

use async_trait::async_trait;

use super::gateway::{
    build_client, check_status, ChatMessage, ProviderDescriptor, ProviderGateway,
    ProviderResponse, SendOptions,
};
use crate::errors::GatewayError;

pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Chat-completions gateway. Also serves OpenAI-compatible vendors by
/// pointing `base_url` elsewhere.
pub struct OpenAiGateway {
    descriptor: ProviderDescriptor,
    base_url: String,
    api_key: String,
    client: Client,
}

impl OpenAiGateway {
    pub fn new(
        descriptor: ProviderDescriptor,
        api_key: String,
        base_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            descriptor,
            base_url: base_url.unwrap_or_else(|| OPENAI_BASE_URL.to_string()),
            api_key,
            client: build_client()?,
        })
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
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let payload = serde_json::json!({
            "model": self.descriptor.model,
            "messages": normalise_messages(messages),
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "stream": false,
        });

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|val| val.as_str())
            .ok_or_else(|| GatewayError::Malformed("missing choices[0].message.content".into()))?
            .to_string();
        let tokens = body
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        Ok((content, tokens))
    }
}

#[async_trait]
impl ProviderGateway for OpenAiGateway {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn send_message(
        &self,
        messages: &[ChatMessage],
        options: &SendOptions,
    ) -> ProviderResponse {
        ProviderResponse::from_result(&self.descriptor, self.request(messages, options).await)
    }
}

fn normalise_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": m.content,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base_url: String) -> OpenAiGateway {
        OpenAiGateway::new(
            ProviderDescriptor {
                id: "openai".into(),
                display_name: "ChatGPT".into(),
                model: "gpt-4o-mini".into(),
            },
            "sk-test".into(),
            Some(base_url),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn parses_content_and_usage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "Paris" } }],
                "usage": { "total_tokens": 17 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = gateway(server.uri())
            .send_message(&[ChatMessage::user("Capital of France?")], &SendOptions::default())
            .await;
        assert_eq!(response.content, "Paris");
        assert_eq!(response.tokens, Some(17));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn auth_failure_becomes_error_field() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .expect(1)
            .mount(&server)
            .await;

        let response = gateway(server.uri())
            .send_message(&[ChatMessage::user("hi")], &SendOptions::default())
            .await;
        assert!(response.content.is_empty());
        let error = response.error.unwrap();
        assert!(error.contains("401"), "unexpected error: {error}");
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({ "choices": [] })))
            .mount(&server)
            .await;

        let response = gateway(server.uri())
            .send_message(&[ChatMessage::user("hi")], &SendOptions::default())
            .await;
        assert!(response.error.unwrap().contains("malformed"));
    }

    #[tokio::test]
    async fn unreachable_host_never_panics() {
        let response = gateway("http://127.0.0.1:9".into())
            .send_message(&[ChatMessage::user("hi")], &SendOptions::default())
            .await;
        assert!(!response.is_valid());
        assert!(response.error.is_some());
    }
}
