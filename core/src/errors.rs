use thiserror::Error;

/// Failures that reach the boundary layer.
#[derive(Debug, Error)]
pub enum ChorusError {
    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Conversation storage unavailable: {0}")]
    Storage(String),
}

impl ChorusError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConversationNotFound(_) => "CNV-1001",
            Self::InvalidInput(_) => "INP-1001",
            Self::Storage(_) => "DB-2001",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::ConversationNotFound(_) => {
                "No conversation exists for the requested ID. Create it before appending."
            }
            Self::InvalidInput(_) => "The request could not be processed as supplied.",
            Self::Storage(_) => {
                "Stored conversation state could not be read. Nothing was changed; retry the request."
            }
        }
    }
}

/// Failures of a single vendor call. These never escape a gateway; they are
/// folded into the provider's response instead.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{0} API key is not configured")]
    MissingCredentials(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("request failed: {0}")]
    Transport(reqwest::Error),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Request URLs can carry credentials, so they never reach the error text.
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.without_url())
    }
}

impl GatewayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingCredentials(_) => "AI-1001",
            Self::Http { .. } => "AI-1002",
            Self::Transport(_) => "AI-1003",
            Self::Malformed(_) => "AI-1004",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::MissingCredentials(_) => "The provider has no credential configured.",
            Self::Http { .. } => "The provider answered with a non-success status.",
            Self::Transport(_) => "The provider could not be reached or timed out.",
            Self::Malformed(_) => "The provider answered with an unexpected body.",
        }
    }

    /// Overload and rate-limit conditions that are worth one more attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http { status, body } => {
                matches!(status, 429 | 503 | 529) || body.to_lowercase().contains("overloaded")
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overload_statuses_are_transient() {
        for status in [429, 503, 529] {
            let err = GatewayError::Http {
                status,
                body: String::new(),
            };
            assert!(err.is_transient(), "status {status} should be transient");
        }
    }

    #[test]
    fn overloaded_body_is_transient() {
        let err = GatewayError::Http {
            status: 500,
            body: "{\"type\":\"overloaded_error\"}".into(),
        };
        assert!(err.is_transient());
    }

    #[test]
    fn auth_failures_are_terminal() {
        let err = GatewayError::Http {
            status: 401,
            body: "invalid x-api-key".into(),
        };
        assert!(!err.is_transient());
        assert!(!GatewayError::MissingCredentials("OpenAI".into()).is_transient());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(ChorusError::ConversationNotFound("x".into()).code(), "CNV-1001");
        assert_eq!(ChorusError::InvalidInput("x".into()).code(), "INP-1001");
        assert_eq!(ChorusError::Storage("x".into()).code(), "DB-2001");
    }
}
