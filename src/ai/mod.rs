//! Generative-AI collaborator
//!
//! Handlers talk to the model provider through [`AiClient`]. The production
//! implementation is [`GeminiClient`]; tests substitute scripted clients.

pub mod gemini;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::AiConfig;
use crate::error::JobError;
use crate::payload::TokenUsage;

pub use gemini::GeminiClient;

/// Per-request generation settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub thinking_budget: Option<i32>,
    /// Requests JSON output constrained to this schema
    pub response_schema: Option<Value>,
    /// Lets the model ground its answer with web search
    pub search: bool,
}

impl GenerationConfig {
    pub fn from_config(config: &AiConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            thinking_budget: config.thinking_budget,
            response_schema: None,
            search: false,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }
}

/// Text returned by the model plus the provider's token accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Error)]
pub enum AiError {
    #[error("provider returned HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("model returned no text (finish reason: {finish_reason})")]
    EmptyResponse { finish_reason: String },
    #[error("AI client misconfigured: {0}")]
    Configuration(String),
}

impl From<AiError> for JobError {
    fn from(error: AiError) -> Self {
        match error {
            AiError::Http {
                status,
                message,
                retry_after_secs,
            } => JobError::from_status(status, message, retry_after_secs),
            AiError::Configuration(message) => JobError::permanent(message),
            other => JobError::transient(other.to_string()),
        }
    }
}

#[async_trait]
pub trait AiClient: Send + Sync {
    async fn generate(
        &self,
        model: &str,
        prompt_parts: &[String],
        config: &GenerationConfig,
    ) -> Result<Generation, AiError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JobErrorKind;

    #[test]
    fn http_errors_are_classified_by_status() {
        let bad_request: JobError = AiError::Http {
            status: 400,
            message: "bad".into(),
            retry_after_secs: None,
        }
        .into();
        assert!(!bad_request.is_retryable());

        let throttled: JobError = AiError::Http {
            status: 429,
            message: "slow down".into(),
            retry_after_secs: Some(12),
        }
        .into();
        assert!(throttled.is_retryable());
        assert_eq!(
            throttled.kind,
            JobErrorKind::RateLimited {
                retry_after_secs: Some(12)
            }
        );

        let outage: JobError = AiError::Http {
            status: 503,
            message: "unavailable".into(),
            retry_after_secs: None,
        }
        .into();
        assert!(outage.is_retryable());
    }

    #[test]
    fn timeouts_are_retryable() {
        let error: JobError = AiError::Timeout.into();
        assert!(error.is_retryable());
    }
}
