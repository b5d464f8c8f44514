//! # Pipeline facade
//!
//! The entry points the rest of the application calls: create an upload, run one
//! dispatcher tick, read progress and apply operator actions. [`Pipeline::from_config`]
//! wires the queue, rate limiter, handlers and collaborators once at startup.

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::ai::{AiClient, AiError, GeminiClient};
use crate::config::AppConfig;
use crate::dispatcher::{DispatchOptions, Dispatcher, DispatcherRunStats};
use crate::error::PipelineError;
use crate::jobs::{HandlerDeps, HandlerRegistry};
use crate::mail::{MailError, Mailer, build_mailer};
use crate::models::{batch, job};
use crate::notifications::Notifier;
use crate::payload::RawRow;
use crate::prompts::{PromptError, PromptSet};
use crate::rate_limiter::RateLimiter;
use crate::repositories::{
    CreatedUpload, JobQueue, NewUpload, NotificationLogRepository, QueueSettings, UploadProgress,
};
use crate::seeder::{DatabaseSeeder, Seeder};
use crate::workbook::{CsvWorkbookWriter, WorkbookWriter};

#[derive(Debug, Error)]
pub enum PipelineBuildError {
    #[error("AI client setup failed: {0}")]
    Ai(#[from] AiError),
    #[error("mailer setup failed: {0}")]
    Mail(#[from] MailError),
    #[error("prompt loading failed: {0}")]
    Prompts(#[from] PromptError),
}

/// Collaborators injected into the pipeline. Tests swap in fakes.
#[derive(Clone)]
pub struct Collaborators {
    /// `None` runs the AI stages in mock mode
    pub ai: Option<Arc<dyn AiClient>>,
    pub mailer: Arc<dyn Mailer>,
    pub seeder: Arc<dyn Seeder>,
    pub workbook: Arc<dyn WorkbookWriter>,
    pub prompts: Arc<PromptSet>,
}

impl Collaborators {
    /// Production collaborators built from configuration.
    pub fn from_config(
        db: &DatabaseConnection,
        config: &AppConfig,
    ) -> Result<Self, PipelineBuildError> {
        let ai: Option<Arc<dyn AiClient>> = if config.ai.enabled {
            Some(Arc::new(GeminiClient::from_config(&config.ai)?))
        } else {
            info!("AI disabled; ANALYZE and STRUCTURE run in mock mode");
            None
        };
        Ok(Self {
            ai,
            mailer: build_mailer(&config.notifications)?,
            seeder: Arc::new(DatabaseSeeder::new(db.clone())),
            workbook: Arc::new(CsvWorkbookWriter),
            prompts: Arc::new(PromptSet::load(config.ai.prompt_dir.as_deref())?),
        })
    }
}

#[derive(Clone)]
pub struct Pipeline {
    queue: JobQueue,
    dispatcher: Dispatcher,
    default_options: DispatchOptions,
}

impl Pipeline {
    pub fn from_config(
        db: DatabaseConnection,
        config: &AppConfig,
    ) -> Result<Self, PipelineBuildError> {
        let collaborators = Collaborators::from_config(&db, config)?;
        Ok(Self::new(db, config, collaborators))
    }

    pub fn new(db: DatabaseConnection, config: &AppConfig, collaborators: Collaborators) -> Self {
        let notifier = Notifier::new(
            NotificationLogRepository::new(db.clone()),
            collaborators.mailer,
            &config.notifications,
        );
        let queue = JobQueue::new(
            db.clone(),
            QueueSettings::from_config(config),
            notifier.clone(),
        );
        let deps = HandlerDeps::from_config(
            config,
            collaborators.ai,
            collaborators.prompts,
            collaborators.seeder,
            collaborators.workbook,
            notifier,
            db.clone(),
        );
        let dispatcher = Dispatcher::new(
            queue.clone(),
            RateLimiter::from_config(db, config),
            HandlerRegistry::standard(deps),
            &config.dispatcher,
        );
        Self {
            queue,
            dispatcher,
            default_options: DispatchOptions::from_config(&config.dispatcher),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn default_options(&self) -> DispatchOptions {
        self.default_options
    }

    /// Groups `rows` into batches and enqueues their job chains.
    pub async fn create_spreadsheet_upload(
        &self,
        rows: Vec<RawRow>,
        uploader_email: &str,
        filename: &str,
        force_hidden: bool,
    ) -> Result<CreatedUpload, PipelineError> {
        self.queue
            .create_upload_with_batches(NewUpload {
                rows,
                uploader_email: uploader_email.trim().to_string(),
                original_filename: filename.to_string(),
                force_hidden,
            })
            .await
    }

    pub async fn run_dispatcher(
        &self,
        options: DispatchOptions,
    ) -> Result<DispatcherRunStats, PipelineError> {
        self.dispatcher.run_once(options).await
    }

    pub async fn get_upload_progress(
        &self,
        upload_id: Uuid,
    ) -> Result<UploadProgress, PipelineError> {
        self.queue.get_upload_progress(upload_id).await
    }

    pub async fn retry_batch(
        &self,
        upload_id: Uuid,
        batch_id: Uuid,
    ) -> Result<batch::Model, PipelineError> {
        self.queue.retry_batch(upload_id, batch_id).await
    }

    pub async fn skip_batch(
        &self,
        upload_id: Uuid,
        batch_id: Uuid,
        reason: &str,
    ) -> Result<batch::Model, PipelineError> {
        self.queue.skip_batch(upload_id, batch_id, reason).await
    }

    pub async fn skip_job(&self, job_id: Uuid, reason: &str) -> Result<job::Model, PipelineError> {
        self.queue.skip_job(job_id, reason).await
    }
}
