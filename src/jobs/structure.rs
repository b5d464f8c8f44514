use async_trait::async_trait;
use tracing::debug;

use super::{HandlerDeps, JobContext, JobHandler, batch_rows, decode};
use crate::error::JobError;
use crate::models::{JobType, batch};
use crate::payload::{
    AiGeneration, AnalysisResult, JobOutput, RawRow, StructuredCandidate, StructuredElection,
    StructuredPayload, TokenUsage,
};

/// Turns the analysis notes into schema-constrained election data.
pub struct StructureHandler {
    deps: HandlerDeps,
}

impl StructureHandler {
    pub fn new(deps: HandlerDeps) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl JobHandler for StructureHandler {
    fn job_type(&self) -> JobType {
        JobType::Structure
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let batch = ctx.require_batch()?;
        let model = ctx.require_model()?;

        let stored = batch.analysis.as_ref().ok_or_else(|| {
            JobError::permanent(format!("batch {} has no analysis yet", batch.id))
        })?;
        let analysis: AnalysisResult = decode(stored, "analysis")?;
        let notes = analysis.output.as_json().ok_or_else(|| {
            JobError::output_parse(format!(
                "analysis for batch {} is not usable JSON",
                batch.id
            ))
        })?;
        let rows = batch_rows(batch, self.deps.max_rows_per_batch)?;

        let Some(ai) = self.deps.ai.as_ref() else {
            debug!(batch_id = %batch.id, "AI disabled; returning mock structure");
            return Ok(JobOutput::Structure(mock_structure(model, batch, &rows)?));
        };

        let config = self
            .deps
            .generation
            .clone()
            .with_schema(self.deps.prompts.structure_schema.clone());
        let parts = self
            .deps
            .prompts
            .structure_parts(&notes.to_string(), &rows);
        let generation = ai.generate(model, &parts, &config).await?;

        Ok(JobOutput::Structure(AiGeneration {
            model: model.to_string(),
            text: generation.text,
            usage: generation.usage,
            mock: false,
        }))
    }
}

/// One election per batch with a candidate for every named row.
fn mock_structure(
    model: &str,
    batch: &batch::Model,
    rows: &[RawRow],
) -> Result<AiGeneration, JobError> {
    let candidates = rows
        .iter()
        .filter_map(|row| {
            let name = row.name.as_deref()?.trim();
            (!name.is_empty()).then(|| StructuredCandidate {
                name: name.to_string(),
                email: row.email.clone(),
                ..StructuredCandidate::default()
            })
        })
        .collect();
    let payload = StructuredPayload {
        elections: vec![StructuredElection {
            municipality: batch.municipality.clone(),
            state: batch.state.clone(),
            position: batch.position.clone(),
            election_date: None,
            description: None,
            candidates,
        }],
    };
    let text = serde_json::to_string(&payload)
        .map_err(|err| JobError::permanent(format!("mock structure failed: {err}")))?;

    Ok(AiGeneration {
        model: model.to_string(),
        text,
        usage: TokenUsage::default(),
        mock: true,
    })
}
