use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{HandlerDeps, JobContext, JobHandler, batch_rows};
use crate::error::JobError;
use crate::models::{JobType, batch};
use crate::payload::{AiGeneration, JobOutput, RawRow, TokenUsage};

/// Researches a batch's race with the AI model and returns its raw notes.
pub struct AnalyzeHandler {
    deps: HandlerDeps,
}

impl AnalyzeHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for AnalyzeHandler {
    fn job_type(&self) -> JobType {
        JobType::Analyze
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let batch = ctx.require_batch()?;
        let model = ctx.require_model()?;
        let rows = batch_rows(batch, self.deps.max_rows_per_batch)?;

        let Some(ai) = self.deps.ai.as_ref() else {
            debug!(batch_id = %batch.id, "AI disabled; returning mock analysis");
            return Ok(JobOutput::Analyze(mock_analysis(model, batch, &rows)));
        };

        let config = self
            .deps
            .generation
            .clone()
            .with_search(self.deps.search_enabled);
        let generation = ai
            .generate(model, &self.deps.prompts.analyze_parts(&rows), &config)
            .await?;

        Ok(JobOutput::Analyze(AiGeneration {
            model: model.to_string(),
            text: generation.text,
            usage: generation.usage,
            mock: false,
        }))
    }
}

fn mock_analysis(model: &str, batch: &batch::Model, rows: &[RawRow]) -> AiGeneration {
    let candidates: Vec<_> = rows
        .iter()
        .map(|row| {
            json!({
                "name": row.name.as_deref().unwrap_or("N/A"),
                "email": row.email.as_deref().unwrap_or("N/A"),
            })
        })
        .collect();
    let text = json!({
        "municipality": batch.municipality,
        "state": batch.state,
        "position": batch.position,
        "candidates": candidates,
    })
    .to_string();

    AiGeneration {
        model: model.to_string(),
        text,
        usage: TokenUsage::default(),
        mock: true,
    }
}
