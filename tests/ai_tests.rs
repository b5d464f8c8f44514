//! Gemini client wire behavior and AI output repair through the STRUCTURE stage.

mod test_utils;

use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use intake::ai::{AiClient, AiError, GeminiClient, GenerationConfig};
use intake::config::AppConfig;
use intake::models::{BatchStatus, JobStatus};
use intake::payload::{ParsedOutput, StructuredResult};
use test_utils::{Harness, options, scenario_rows, test_config};

const MODEL_PATH: &str = "/v1beta/models/gemini-2.5-flash:generateContent";

fn client(server: &MockServer) -> GeminiClient {
    GeminiClient::new(&server.uri(), "test-key", Duration::from_secs(5)).unwrap()
}

fn generation() -> GenerationConfig {
    GenerationConfig::from_config(&AppConfig::default().ai)
}

#[tokio::test]
async fn generate_joins_text_parts_and_reports_usage() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .and(header("x-goog-api-key", "test-key"))
        .and(body_partial_json(json!({
            "contents": [{"role": "user", "parts": [{"text": "rows"}]}]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "{\"ok\": "},
                    {"text": "true}"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {
                "promptTokenCount": 12,
                "candidatesTokenCount": 5,
                "totalTokenCount": 17
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server)
        .generate("gemini-2.5-flash", &["rows".to_string()], &generation())
        .await
        .unwrap();
    assert_eq!(result.text, "{\"ok\": true}");
    assert_eq!(result.usage.prompt_tokens, 12);
    assert_eq!(result.usage.candidate_tokens, 5);
    assert_eq!(result.usage.total_tokens, 17);
}

#[tokio::test]
async fn schema_requests_ask_for_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .and(body_partial_json(json!({
            "generationConfig": {"responseMimeType": "application/json"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": [{"text": "{}"}]}}]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let config = generation().with_schema(json!({"type": "object"}));
    let result = client(&server)
        .generate("gemini-2.5-flash", &["rows".to_string()], &config)
        .await
        .unwrap();
    assert_eq!(result.text, "{}");
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "17")
                .set_body_json(json!({"error": {"code": 429, "message": "quota exhausted"}})),
        )
        .mount(&server)
        .await;

    let err = client(&server)
        .generate("gemini-2.5-flash", &["rows".to_string()], &generation())
        .await
        .unwrap_err();
    match err {
        AiError::Http {
            status,
            message,
            retry_after_secs,
        } => {
            assert_eq!(status, 429);
            assert_eq!(message, "quota exhausted");
            assert_eq!(retry_after_secs, Some(17));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn empty_candidate_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(MODEL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "candidates": [{"content": {"parts": []}, "finishReason": "SAFETY"}]
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .generate("gemini-2.5-flash", &["rows".to_string()], &generation())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        AiError::EmptyResponse { ref finish_reason } if finish_reason == "SAFETY"
    ));
}

#[tokio::test]
async fn fenced_output_with_placeholders_is_repaired() -> anyhow::Result<()> {
    let harness = Harness::with_ai(test_config()).await?;
    harness
        .ai()
        .set_structure_text("```json\n{\"a\": \"N/A\",}\n```");
    let created = harness
        .pipeline
        .create_spreadsheet_upload(
            vec![scenario_rows().remove(0)],
            "clerk@example.gov",
            "one.csv",
            false,
        )
        .await?;
    let batch_id = created.batches[0].id;

    // ANALYZE, then STRUCTURE
    for _ in 0..2 {
        let stats = harness.pipeline.run_dispatcher(options()).await?;
        assert_eq!(stats.succeeded, 1);
    }

    let batch = harness.batch(batch_id).await?;
    let structured: StructuredResult =
        serde_json::from_value(batch.structured.expect("structured output stored"))?;
    assert_eq!(structured.model, "m1");
    assert_eq!(
        structured.output,
        ParsedOutput::Json {
            value: json!({"a": null})
        }
    );
    assert_eq!(
        harness.job(batch.structure_job_id.unwrap()).await?.status,
        JobStatus::Succeeded
    );
    assert_eq!(batch.status, BatchStatus::Structuring);
    Ok(())
}
