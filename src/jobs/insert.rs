use std::sync::Arc;

use async_trait::async_trait;

use super::{JobContext, JobHandler, decode};
use crate::error::JobError;
use crate::models::JobType;
use crate::payload::{JobOutput, PayloadError, StructuredPayload, StructuredResult};
use crate::seeder::{SeedError, SeedRequest, Seeder};

/// Writes a batch's structured elections and candidates.
pub struct InsertHandler {
    seeder: Arc<dyn Seeder>,
}

impl InsertHandler {
    pub fn new(seeder: Arc<dyn Seeder>) -> Self {
        Self { seeder }
    }
}

#[async_trait]
impl JobHandler for InsertHandler {
    fn job_type(&self) -> JobType {
        JobType::Insert
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError> {
        let batch = ctx.require_batch()?;
        let stored = batch.structured.as_ref().ok_or_else(|| {
            JobError::permanent(format!("batch {} has no structured data yet", batch.id))
        })?;
        let structured: StructuredResult = decode(stored, "structured data")?;
        let payload = StructuredPayload::from_output(&structured.output).map_err(|err| match err {
            PayloadError::Opaque => JobError::output_parse(format!(
                "structured output for batch {} is not JSON",
                batch.id
            )),
            PayloadError::Shape(err) => JobError::output_parse(format!(
                "structured output for batch {} has the wrong shape: {err}",
                batch.id
            )),
        })?;

        let summary = self
            .seeder
            .seed(SeedRequest {
                upload_id: ctx.upload.id,
                payload: &payload,
                force_hidden: ctx.upload.force_hidden,
            })
            .await
            .map_err(|err| match err {
                SeedError::MissingField(_) => JobError::output_parse(err.to_string()),
                SeedError::Conflict(_) | SeedError::Database(_) => {
                    JobError::transient(err.to_string())
                }
            })?;

        Ok(JobOutput::Insert(summary))
    }
}
