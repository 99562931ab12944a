/// Wire dialect spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
}

#[derive(Debug)]
pub struct ProviderSeed {
    pub id: &'static str,
    pub kind: ProviderKind,
    pub display: &'static str,
    pub description: &'static str,
    pub base_url: Option<&'static str>,
    pub default_model: &'static str,
    pub env_key: &'static str,
}

/// Known providers in fan-out order.
pub static PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: "openai",
        kind: ProviderKind::OpenAi,
        display: "ChatGPT",
        description: "OpenAI chat completions",
        base_url: None,
        default_model: "gpt-4o-mini",
        env_key: "OPENAI_API_KEY",
    },
    ProviderSeed {
        id: "anthropic",
        kind: ProviderKind::Anthropic,
        display: "Claude",
        description: "Anthropic messages API",
        base_url: None,
        default_model: "claude-3-5-sonnet-latest",
        env_key: "ANTHROPIC_API_KEY",
    },
    ProviderSeed {
        id: "google",
        kind: ProviderKind::Gemini,
        display: "Gemini",
        description: "Google Generative Language API",
        base_url: None,
        default_model: "gemini-1.5-flash",
        env_key: "GEMINI_API_KEY",
    },
    ProviderSeed {
        id: "mistral",
        kind: ProviderKind::OpenAi,
        display: "Mistral",
        description: "Mistral La Plateforme (OpenAI-compatible)",
        base_url: Some("https://api.mistral.ai"),
        default_model: "mistral-large-latest",
        env_key: "MISTRAL_API_KEY",
    },
    ProviderSeed {
        id: "deepseek",
        kind: ProviderKind::OpenAi,
        display: "DeepSeek",
        description: "DeepSeek chat (OpenAI-compatible)",
        base_url: Some("https://api.deepseek.com"),
        default_model: "deepseek-chat",
        env_key: "DEEPSEEK_API_KEY",
    },
];

pub fn find_seed(id: &str) -> Option<&'static ProviderSeed> {
    PROVIDER_SEEDS.iter().find(|seed| seed.id == id)
}
