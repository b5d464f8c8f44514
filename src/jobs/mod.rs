//! # Job Handlers
//!
//! One [`JobHandler`] per [`JobType`], looked up through a [`HandlerRegistry`] that the
//! dispatcher owns. Handlers read their inputs from the job's upload and batch, do the
//! stage's work and return a typed [`JobOutput`]; persisting that output is the queue's job.

mod analyze;
mod insert;
mod notification;
mod structure;
mod workbook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::ai::{AiClient, GenerationConfig};
use crate::config::AppConfig;
use crate::error::JobError;
use crate::models::{Batch, JobType, Upload, batch, job, upload};
use crate::notifications::Notifier;
use crate::payload::{JobOutput, RawRow, RawRows};
use crate::prompts::PromptSet;
use crate::seeder::Seeder;
use crate::workbook::WorkbookWriter;

pub use analyze::AnalyzeHandler;
pub use insert::InsertHandler;
pub use notification::NotificationHandler;
pub use structure::StructureHandler;
pub use workbook::{WorkbookHandler, results_filename};

/// Everything a handler needs about the job it runs.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job: job::Model,
    pub upload: upload::Model,
    /// Present for ANALYZE, STRUCTURE and INSERT
    pub batch: Option<batch::Model>,
    /// Model chosen by the dispatcher; `None` for local stages
    pub model: Option<String>,
}

impl JobContext {
    /// Loads the upload and batch of a claimed job.
    pub async fn load(
        db: &DatabaseConnection,
        job: job::Model,
        model: Option<String>,
    ) -> Result<Self, JobError> {
        let upload = Upload::find_by_id(job.upload_id)
            .one(db)
            .await?
            .ok_or_else(|| JobError::permanent(format!("upload {} not found", job.upload_id)))?;
        let batch = match job.batch_id {
            Some(batch_id) => Some(
                Batch::find_by_id(batch_id)
                    .one(db)
                    .await?
                    .ok_or_else(|| JobError::permanent(format!("batch {batch_id} not found")))?,
            ),
            None => None,
        };
        Ok(Self {
            job,
            upload,
            batch,
            model,
        })
    }

    pub fn require_batch(&self) -> Result<&batch::Model, JobError> {
        self.batch.as_ref().ok_or_else(|| {
            JobError::permanent(format!("{} job {} has no batch", self.job.job_type, self.job.id))
        })
    }

    pub fn require_model(&self) -> Result<&str, JobError> {
        self.model.as_deref().ok_or_else(|| {
            JobError::permanent(format!("{} job {} ran without a model", self.job.job_type, self.job.id))
        })
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> JobType;

    async fn run(&self, ctx: &JobContext) -> Result<JobOutput, JobError>;
}

/// Collaborators shared by the built-in handlers.
#[derive(Clone)]
pub struct HandlerDeps {
    /// `None` runs the AI stages in mock mode
    pub ai: Option<Arc<dyn AiClient>>,
    pub prompts: Arc<PromptSet>,
    pub generation: GenerationConfig,
    pub search_enabled: bool,
    pub max_rows_per_batch: usize,
    pub seeder: Arc<dyn Seeder>,
    pub workbook: Arc<dyn WorkbookWriter>,
    pub notifier: Notifier,
    pub db: DatabaseConnection,
    pub public_base_url: String,
}

impl HandlerDeps {
    /// Wires the non-AI settings from `config`; collaborators are passed in.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: &AppConfig,
        ai: Option<Arc<dyn AiClient>>,
        prompts: Arc<PromptSet>,
        seeder: Arc<dyn Seeder>,
        workbook: Arc<dyn WorkbookWriter>,
        notifier: Notifier,
        db: DatabaseConnection,
    ) -> Self {
        Self {
            ai,
            prompts,
            generation: GenerationConfig::from_config(&config.ai),
            search_enabled: config.ai.search_enabled,
            max_rows_per_batch: config.ai.max_rows_per_batch,
            seeder,
            workbook,
            notifier,
            db,
            public_base_url: config
                .notifications
                .public_base_url
                .trim_end_matches('/')
                .to_string(),
        }
    }
}

/// Handlers keyed by job type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the five pipeline stages.
    pub fn standard(deps: HandlerDeps) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AnalyzeHandler::new(deps.clone())));
        registry.register(Arc::new(StructureHandler::new(deps.clone())));
        registry.register(Arc::new(InsertHandler::new(deps.seeder.clone())));
        registry.register(Arc::new(WorkbookHandler::new(
            deps.workbook.clone(),
            deps.public_base_url.clone(),
        )));
        registry.register(Arc::new(NotificationHandler::new(deps.db, deps.notifier)));
        registry
    }

    /// Adds or replaces the handler for its job type.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}

/// Decodes a stored JSON column; a mismatch means the stage input is unusable.
pub(crate) fn decode<T: DeserializeOwned>(value: &Value, what: &str) -> Result<T, JobError> {
    serde_json::from_value(value.clone())
        .map_err(|err| JobError::output_parse(format!("stored {what} is malformed: {err}")))
}

/// Batch rows capped at `max_rows`.
pub(crate) fn batch_rows(batch: &batch::Model, max_rows: usize) -> Result<Vec<RawRow>, JobError> {
    let raw = batch.raw_rows.as_ref().ok_or_else(|| {
        JobError::permanent(format!("batch {} rows have been scrubbed", batch.id))
    })?;
    let RawRows(mut rows) = decode(raw, "batch rows")?;
    if rows.len() > max_rows {
        warn!(
            batch_id = %batch.id,
            rows = rows.len(),
            max_rows,
            "Batch exceeds row cap; extra rows are not sent to the model"
        );
        rows.truncate(max_rows);
    }
    Ok(rows)
}
