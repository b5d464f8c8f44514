//! Typed payloads stored in the JSON columns of uploads, batches and attempts.
//!
//! Every blob that crosses a stage boundary is one of these types. Decoding a
//! stored value that does not match its type is an output-parse failure, never a panic.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// One uploaded spreadsheet row.
///
/// The grouping columns are typed; every other column is preserved as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct RawRow {
    #[serde(default, alias = "city", skip_serializing_if = "Option::is_none")]
    pub municipality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: BTreeMap<String, Value>,
}

impl RawRow {
    pub fn new(municipality: &str, state: &str, position: &str) -> Self {
        Self {
            municipality: Some(municipality.to_string()),
            state: Some(state.to_string()),
            position: Some(position.to_string()),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: &str) -> Self {
        self.email = Some(email.to_string());
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}

/// Ordered list of rows as stored on a batch or upload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRows(pub Vec<RawRow>);

impl RawRows {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, RawRow> {
        self.0.iter()
    }
}

/// Token usage reported by the AI service for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub candidate_tokens: i64,
    pub total_tokens: i64,
}

/// Raw text returned by an AI-backed stage before it is parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiGeneration {
    pub model: String,
    pub text: String,
    pub usage: TokenUsage,
    /// Produced by the deterministic mock instead of the live service
    #[serde(default)]
    pub mock: bool,
}

/// AI output after the repair pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum ParsedOutput {
    Json { value: Value },
    /// Text that did not parse even after repair; unusable downstream
    Opaque { text: String },
}

impl ParsedOutput {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ParsedOutput::Json { value } => Some(value),
            ParsedOutput::Opaque { .. } => None,
        }
    }
}

/// ANALYZE output stored on the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub model: String,
    pub output: ParsedOutput,
    pub usage: TokenUsage,
}

/// STRUCTURE output stored on the batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub model: String,
    pub output: ParsedOutput,
    pub usage: TokenUsage,
}

/// Schema-constrained shape the STRUCTURE stage asks the model for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredPayload {
    #[serde(default)]
    pub elections: Vec<StructuredElection>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredElection {
    pub municipality: String,
    pub state: String,
    pub position: String,
    #[serde(default)]
    pub election_date: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub candidates: Vec<StructuredCandidate>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StructuredCandidate {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub party: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("stored output could not be parsed as JSON")]
    Opaque,
    #[error("output does not match the expected shape: {0}")]
    Shape(#[from] serde_json::Error),
}

impl StructuredPayload {
    pub fn from_output(output: &ParsedOutput) -> Result<Self, PayloadError> {
        let value = output.as_json().ok_or(PayloadError::Opaque)?;
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Result of seeding one batch's structured data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct InsertSummary {
    pub elections_created: u32,
    pub elections_updated: u32,
    pub candidates_created: u32,
    pub candidates_updated: u32,
    /// Lowercased candidate email to profile slug
    #[serde(default)]
    pub email_to_slug: BTreeMap<String, String>,
    #[serde(default)]
    pub candidate_slugs: Vec<String>,
}

/// Insert result recorded on the upload summary for one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct BatchInsertResult {
    pub batch_id: Uuid,
    pub summary: InsertSummary,
}

/// Base64 spreadsheet produced by the WORKBOOK stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkbookResult {
    pub filename: String,
    pub content_type: String,
    pub content_base64: String,
    pub row_count: usize,
}

/// Delivery receipt produced by the NOTIFICATION stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationResult {
    pub message_id: String,
    pub recipients: Vec<String>,
}

/// Successful output of any handler, persisted on the attempt row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobOutput {
    Analyze(AiGeneration),
    Structure(AiGeneration),
    Insert(InsertSummary),
    Workbook(WorkbookResult),
    Notification(NotificationResult),
}

impl JobOutput {
    /// Actual token usage for AI-backed stages.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            JobOutput::Analyze(generation) | JobOutput::Structure(generation) => {
                Some(generation.usage)
            }
            _ => None,
        }
    }
}

/// Per-status batch counters kept on the upload summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct BatchCounts {
    pub queued: u32,
    pub analyzing: u32,
    pub structuring: u32,
    pub inserting: u32,
    pub completed: u32,
    pub failed: u32,
    pub needs_reupload: u32,
}

impl BatchCounts {
    pub fn total(&self) -> u32 {
        self.queued
            + self.analyzing
            + self.structuring
            + self.inserting
            + self.completed
            + self.failed
            + self.needs_reupload
    }

    pub fn active(&self) -> u32 {
        self.queued + self.analyzing + self.structuring + self.inserting
    }

    pub fn failures(&self) -> u32 {
        self.failed + self.needs_reupload
    }
}

/// First time every batch passed each stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StageTimestamps {
    #[serde(default)]
    pub analyze_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub structure_completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub insert_completed_at: Option<DateTime<Utc>>,
}

/// Aggregate stored in `uploads.summary`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UploadSummary {
    pub total_rows: u32,
    pub total_batches: u32,
    #[serde(default)]
    pub batch_counts: BatchCounts,
    #[serde(default)]
    pub stages: StageTimestamps,
    #[serde(default)]
    pub insert_results: Vec<BatchInsertResult>,
}

impl UploadSummary {
    /// Lenient decode; a damaged blob restarts from defaults.
    pub fn from_json(value: &Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Replaces the insert result for a batch, keeping one entry per batch.
    pub fn record_insert(&mut self, batch_id: Uuid, summary: InsertSummary) {
        self.insert_results.retain(|entry| entry.batch_id != batch_id);
        self.insert_results.push(BatchInsertResult { batch_id, summary });
    }

    pub fn email_to_slug(&self) -> BTreeMap<String, String> {
        self.insert_results
            .iter()
            .flat_map(|entry| entry.summary.email_to_slug.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_row_accepts_city_alias_and_keeps_extra_columns() {
        let row: RawRow = serde_json::from_value(json!({
            "city": "Springfield",
            "state": "IL",
            "position": "Mayor",
            "phone": "555-0100"
        }))
        .unwrap();

        assert_eq!(row.municipality.as_deref(), Some("Springfield"));
        assert_eq!(row.extra.get("phone"), Some(&json!("555-0100")));
    }

    #[test]
    fn job_output_is_tagged() {
        let output = JobOutput::Notification(NotificationResult {
            message_id: "m-1".into(),
            recipients: vec!["a@example.com".into()],
        });
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["type"], "NOTIFICATION");
        assert_eq!(value["result"]["message_id"], "m-1");
        assert!(output.usage().is_none());
    }

    #[test]
    fn structured_payload_rejects_opaque_output() {
        let opaque = ParsedOutput::Opaque {
            text: "not json".into(),
        };
        assert!(matches!(
            StructuredPayload::from_output(&opaque),
            Err(PayloadError::Opaque)
        ));

        let wrong_shape = ParsedOutput::Json {
            value: json!({"elections": "nope"}),
        };
        assert!(matches!(
            StructuredPayload::from_output(&wrong_shape),
            Err(PayloadError::Shape(_))
        ));
    }

    #[test]
    fn record_insert_replaces_previous_entry_for_batch() {
        let batch = Uuid::new_v4();
        let mut summary = UploadSummary::default();
        summary.record_insert(batch, InsertSummary::default());
        summary.record_insert(
            batch,
            InsertSummary {
                candidates_created: 2,
                ..InsertSummary::default()
            },
        );

        assert_eq!(summary.insert_results.len(), 1);
        assert_eq!(summary.insert_results[0].summary.candidates_created, 2);
    }
}
