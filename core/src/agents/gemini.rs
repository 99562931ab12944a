use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::gateway::{
    build_client, check_status, ChatMessage, ProviderDescriptor, ProviderGateway,
    ProviderResponse, RetryPolicy, Role, SendOptions,
};
use crate::errors::GatewayError;

pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiGateway {
    descriptor: ProviderDescriptor,
    base_url: String,
    api_key: String,
    client: Client,
    retry: RetryPolicy,
}

impl GeminiGateway {
    pub fn new(
        descriptor: ProviderDescriptor,
        api_key: String,
        base_url: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            descriptor,
            base_url: base_url.unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
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
        let endpoint = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.descriptor.model,
        );

        let mut payload = serde_json::json!({
            "contents": build_contents(messages),
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            }
        });
        let system = system_instruction(messages);
        if !system.is_empty() {
            payload["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system }] });
        }

        let response = self
            .client
            .post(endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await?;
        let body: Value = check_status(response).await?.json().await?;
        let content = body
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|cand| cand.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(|parts| parts.as_array())
            .ok_or_else(|| GatewayError::Malformed("missing candidates[0].content.parts".into()))?
            .iter()
            .filter_map(|part| part.get("text").and_then(|text| text.as_str()))
            .collect::<Vec<_>>()
            .join("");
        let tokens = body
            .get("usageMetadata")
            .and_then(|usage| usage.get("totalTokenCount"))
            .and_then(|v| v.as_u64())
            .map(|v| v as u32);
        Ok((content, tokens))
    }
}

#[async_trait]
impl ProviderGateway for GeminiGateway {
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

fn build_contents(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "model" } else { "user" };
            serde_json::json!({
                "role": role,
                "parts": [{ "text": m.content.trim() }],
            })
        })
        .collect()
}

fn system_instruction(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.trim())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(base_url: String) -> GeminiGateway {
        GeminiGateway::new(
            ProviderDescriptor {
                id: "google".into(),
                display_name: "Gemini".into(),
                model: "gemini-1.5-flash".into(),
            },
            "g-key".into(),
            Some(base_url),
        )
        .unwrap()
        .with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(5),
        })
    }

    #[test]
    fn assistant_turns_map_to_model_role() {
        let contents = build_contents(&[
            ChatMessage::system("ignored here"),
            ChatMessage::user("hi"),
            ChatMessage::assistant("hello"),
        ]);
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["role"], "model");
    }

    #[tokio::test]
    async fn parses_candidate_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-1.5-flash:generateContent"))
            .and(header("x-goog-api-key", "g-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "Par" }, { "text": "is" }] } }],
                "usageMetadata": { "totalTokenCount": 9 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let response = gateway(server.uri())
            .send_message(&[ChatMessage::user("Capital of France?")], &SendOptions::default())
            .await;
        assert_eq!(response.content, "Paris");
        assert_eq!(response.tokens, Some(9));
    }

    #[tokio::test]
    async fn transport_errors_never_echo_the_key() {
        let gateway = GeminiGateway::new(
            ProviderDescriptor {
                id: "google".into(),
                display_name: "Gemini".into(),
                model: "gemini-1.5-flash".into(),
            },
            "g-secret-key".into(),
            Some("http://127.0.0.1:9".into()),
        )
        .unwrap()
        .with_retry(RetryPolicy::none());

        let response = gateway
            .send_message(&[ChatMessage::user("hi")], &SendOptions::default())
            .await;
        let error = response.error.unwrap();
        assert!(error.starts_with("request failed"), "{error}");
        assert!(!error.contains("g-secret-key"));
        assert!(!error.contains("127.0.0.1:9"));
    }

    #[tokio::test]
    async fn key_travels_in_header_not_query() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }]
            })))
            .mount(&server)
            .await;

        gateway(server.uri())
            .send_message(&[ChatMessage::user("hi")], &SendOptions::default())
            .await;
        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.query(), None);
        assert_eq!(requests[0].headers.get("x-goog-api-key").unwrap(), "g-key");
    }

    #[tokio::test]
    async fn service_unavailable_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("The model is overloaded."))
            .expect(2)
            .mount(&server)
            .await;

        let response = gateway(server.uri())
            .send_message(&[ChatMessage::user("hi")], &SendOptions::default())
            .await;
        assert!(response.error.unwrap().contains("503"));
    }
}
