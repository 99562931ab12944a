pub mod anthropic;
pub mod config;
pub mod gateway;
pub mod gemini;
#[cfg(test)]
pub mod mock;
pub mod openai;
pub mod orchestrator;
pub mod providers;

pub use config::{AiProviderInfo, OrchestratorSettings, ProviderCredential};
pub use gateway::{
    ChatMessage, ProviderDescriptor, ProviderGateway, ProviderResponse, RetryPolicy, Role,
    SendOptions,
};
pub use orchestrator::Orchestrator;
