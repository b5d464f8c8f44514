//! Gemini REST client (`models/{model}:generateContent`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{AiClient, AiError, Generation, GenerationConfig};
use crate::config::AiConfig;
use crate::error::truncate_message;
use crate::payload::TokenUsage;

const API_KEY_HEADER: &str = "x-goog-api-key";
const RETRY_INFO_TYPE: &str = "type.googleapis.com/google.rpc.RetryInfo";

pub struct GeminiClient {
    client: Client,
    api_base: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: RequestGenerationConfig<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestGenerationConfig<'a> {
    temperature: f32,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    thinking_config: Option<ThinkingConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_schema: Option<&'a Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ThinkingConfig {
    thinking_budget: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    candidates_token_count: i64,
    #[serde(default)]
    total_token_count: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<Value>,
}

impl GeminiClient {
    pub fn new(api_base: &str, api_key: &str, timeout: Duration) -> Result<Self, AiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AiError::Configuration(err.to_string()))?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_config(config: &AiConfig) -> Result<Self, AiError> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| AiError::Configuration("AI API key is not set".to_string()))?;
        Self::new(
            &config.api_base,
            api_key,
            Duration::from_secs(config.request_timeout_seconds),
        )
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.api_base, model)
    }
}

#[async_trait]
impl AiClient for GeminiClient {
    async fn generate(
        &self,
        model: &str,
        prompt_parts: &[String],
        config: &GenerationConfig,
    ) -> Result<Generation, AiError> {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: prompt_parts.iter().map(|text| Part { text }).collect(),
            }],
            generation_config: RequestGenerationConfig {
                temperature: config.temperature,
                max_output_tokens: config.max_output_tokens,
                thinking_config: config.thinking_budget.map(|thinking_budget| ThinkingConfig {
                    thinking_budget,
                }),
                response_mime_type: config
                    .response_schema
                    .as_ref()
                    .map(|_| "application/json"),
                response_schema: config.response_schema.as_ref(),
            },
            tools: if config.search {
                vec![serde_json::json!({ "google_search": {} })]
            } else {
                Vec::new()
            },
        };

        debug!(model, parts = prompt_parts.len(), "Calling Gemini");
        let response = self
            .client
            .post(self.endpoint(model))
            .header(API_KEY_HEADER, &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let header_retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (message, detail_retry_after) = parse_error_body(&body);
            warn!(model, status = status.as_u16(), "Gemini request failed");
            return Err(AiError::Http {
                status: status.as_u16(),
                message: truncate_message(&message, 500),
                retry_after_secs: header_retry_after.or(detail_retry_after),
            });
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|err| AiError::InvalidResponse(err.to_string()))?;
        extract_generation(body)
    }
}

fn map_transport_error(err: reqwest::Error) -> AiError {
    if err.is_timeout() {
        AiError::Timeout
    } else {
        AiError::Network(err.to_string())
    }
}

fn extract_generation(body: GenerateResponse) -> Result<Generation, AiError> {
    let usage = body.usage_metadata.unwrap_or_default();
    let candidate = body.candidates.into_iter().next();
    let finish_reason = candidate
        .as_ref()
        .and_then(|candidate| candidate.finish_reason.clone())
        .unwrap_or_else(|| "NONE".to_string());

    let text: String = candidate
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|part| part.thought != Some(true))
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(AiError::EmptyResponse { finish_reason });
    }

    Ok(Generation {
        text,
        usage: TokenUsage {
            prompt_tokens: usage.prompt_token_count,
            candidate_tokens: usage.candidates_token_count,
            total_tokens: usage.total_token_count,
        },
    })
}

/// Error message and `RetryInfo.retryDelay` (e.g. `"37s"`) from an error body.
fn parse_error_body(body: &str) -> (String, Option<u64>) {
    let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(body) else {
        return (body.to_string(), None);
    };
    let retry_after = envelope
        .error
        .details
        .iter()
        .filter(|detail| detail.get("@type").and_then(Value::as_str) == Some(RETRY_INFO_TYPE))
        .find_map(|detail| detail.get("retryDelay").and_then(Value::as_str))
        .and_then(parse_delay);
    (envelope.error.message, retry_after)
}

fn parse_delay(delay: &str) -> Option<u64> {
    let seconds: f64 = delay.trim().strip_suffix('s')?.parse().ok()?;
    (seconds >= 0.0).then(|| seconds.ceil() as u64)
}
