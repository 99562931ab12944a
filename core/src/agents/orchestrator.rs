//! Parallel fan-out over the configured provider gateways.
//!
//! `query_all` waits for every call to settle before returning. A failing or
//! slow provider never cancels its siblings; there is no aggregate deadline,
//! only the per-call timeout each gateway applies to its own client.

use std::sync::Arc;

use futures::future::join_all;

use super::gateway::{ChatMessage, ProviderDescriptor, ProviderGateway, ProviderResponse, SendOptions};

pub struct Orchestrator {
    gateways: Vec<Arc<dyn ProviderGateway>>,
}

impl Orchestrator {
    pub fn new(gateways: Vec<Arc<dyn ProviderGateway>>) -> Self {
        Self { gateways }
    }

    /// Ids of providers whose credentials were present at startup.
    pub fn available_providers(&self) -> Vec<String> {
        self.gateways
            .iter()
            .map(|g| g.descriptor().id.clone())
            .collect()
    }

    pub fn gateway(&self, provider_id: &str) -> Option<Arc<dyn ProviderGateway>> {
        self.gateways
            .iter()
            .find(|g| g.descriptor().id == provider_id)
            .cloned()
    }

    /// One response per requested id, in request order, success or failure.
    pub async fn query_all(
        &self,
        messages: &[ChatMessage],
        provider_ids: &[String],
        options: &SendOptions,
    ) -> Vec<ProviderResponse> {
        let calls = provider_ids
            .iter()
            .map(|id| self.query_single(id, messages, options));
        let responses = join_all(calls).await;

        let failed = responses.iter().filter(|r| r.error.is_some()).count();
        tracing::info!(
            "fan-out settled: {} providers, {} failed",
            responses.len(),
            failed
        );
        responses
    }

    pub async fn query_single(
        &self,
        provider_id: &str,
        messages: &[ChatMessage],
        options: &SendOptions,
    ) -> ProviderResponse {
        match self.gateway(provider_id) {
            Some(gateway) => gateway.send_message(messages, options).await,
            None => ProviderResponse::failure(
                ProviderDescriptor {
                    id: provider_id.to_string(),
                    display_name: provider_id.to_string(),
                    model: String::new(),
                },
                format!("provider {provider_id} is not configured"),
            ),
        }
    }
}
