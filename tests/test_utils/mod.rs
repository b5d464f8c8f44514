//! Shared fixtures for the integration tests: a migrated in-memory database, a
//! pipeline configuration with fast retries, and scripted collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use sea_orm::{DatabaseConnection, EntityTrait};
use tempfile::TempDir;
use uuid::Uuid;

use intake::ai::{AiClient, AiError, Generation, GenerationConfig};
use intake::config::AppConfig;
use intake::db;
use intake::dispatcher::{DispatchOptions, Dispatcher, DispatcherRunStats};
use intake::jobs::{HandlerDeps, HandlerRegistry, JobHandler};
use intake::mail::{MailError, MailMessage, Mailer, SentMail};
use intake::models::{Batch, Job, Upload, batch, job, upload};
use intake::notifications::Notifier;
use intake::payload::{RawRow, TokenUsage};
use intake::pipeline::{Collaborators, Pipeline};
use intake::prompts::PromptSet;
use intake::rate_limiter::RateLimiter;
use intake::repositories::{JobQueue, NotificationLogRepository, QueueSettings};
use intake::seeder::DatabaseSeeder;
use intake::workbook::CsvWorkbookWriter;

/// Single-connection in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let config = AppConfig {
        database_url: "sqlite::memory:".to_string(),
        db_max_connections: 1,
        ..AppConfig::default()
    };
    let db = db::init_pool(&config).await?;
    db::run_migrations(&db).await?;
    Ok(db)
}

/// Migrated SQLite file under `dir` served by a pool of `connections`, so
/// concurrent transactions really overlap.
pub async fn setup_file_db(dir: &TempDir, connections: u32) -> Result<DatabaseConnection> {
    let path = dir.path().join("intake.db");
    let config = AppConfig {
        database_url: format!("sqlite://{}?mode=rwc", path.display()),
        db_max_connections: connections,
        ..AppConfig::default()
    };
    let db = db::init_pool(&config).await?;
    db::run_migrations(&db).await?;
    Ok(db)
}

/// Pipeline settings with models `m1` (fallback `m2`), no rate limits and instant retries.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        profile: "test".to_string(),
        model_limits: Default::default(),
        ..AppConfig::default()
    };
    config.ai.analyze_models = vec!["m1".to_string()];
    config.ai.analyze_fallback_models = vec!["m2".to_string()];
    config.ai.structure_models = vec!["m1".to_string()];
    config.ai.structure_fallback_models = vec!["m2".to_string()];
    config.ai.max_output_tokens = 1_000;
    config.retry.base_seconds = 0;
    config.retry.max_seconds = 0;
    config.retry.jitter_factor = 0.0;
    config.retry.max_retries = 3;
    config.retry.max_retries_local = 2;
    config.notifications.public_base_url = "https://intake.test".to_string();
    config
}

pub fn options() -> DispatchOptions {
    DispatchOptions {
        max_jobs: 50,
        time_budget: Duration::from_secs(30),
        concurrency: 3,
    }
}

/// Two Springfield/IL/Mayor rows and one Austin/TX/Clerk row.
pub fn scenario_rows() -> Vec<RawRow> {
    vec![
        RawRow::new("Springfield", "IL", "Mayor")
            .with_name("Ann Lee")
            .with_email("ann@example.com"),
        RawRow::new("Springfield", "IL", "Mayor")
            .with_name("Bo Park")
            .with_email("bo@example.com"),
        RawRow::new("Austin", "TX", "Clerk")
            .with_name("Cy Diaz")
            .with_email("cy@example.com"),
    ]
}

/// Scripted AI model. Failures are queued per model as HTTP statuses; everything
/// else succeeds with canned text.
#[derive(Default)]
pub struct FakeAi {
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<(u16, Option<u64>)>>>,
    structure_text: Mutex<Option<String>>,
}

impl FakeAi {
    pub fn fail_next(&self, model: &str, status: u16, retry_after_secs: Option<u64>) {
        self.failures
            .lock()
            .unwrap()
            .entry(model.to_string())
            .or_default()
            .push_back((status, retry_after_secs));
    }

    pub fn set_structure_text(&self, text: &str) {
        *self.structure_text.lock().unwrap() = Some(text.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AiClient for FakeAi {
    async fn generate(
        &self,
        model: &str,
        _prompt_parts: &[String],
        config: &GenerationConfig,
    ) -> Result<Generation, AiError> {
        self.calls.lock().unwrap().push(model.to_string());
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(model)
            .and_then(VecDeque::pop_front);
        if let Some((status, retry_after_secs)) = failure {
            return Err(AiError::Http {
                status,
                message: format!("scripted failure {status}"),
                retry_after_secs,
            });
        }

        let text = if config.response_schema.is_some() {
            self.structure_text.lock().unwrap().clone().unwrap_or_else(|| {
                serde_json::json!({
                    "elections": [{
                        "municipality": "Springfield",
                        "state": "IL",
                        "position": "Mayor",
                        "candidates": [{"name": "Ann Lee", "email": "ann@example.com"}]
                    }]
                })
                .to_string()
            })
        } else {
            r#"{"candidates": [{"name": "Ann Lee", "verified": true}]}"#.to_string()
        };
        Ok(Generation {
            text,
            usage: TokenUsage {
                prompt_tokens: 120,
                candidate_tokens: 80,
                total_tokens: 200,
            },
        })
    }
}

/// Mailer that keeps every message it was asked to send.
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<MailMessage>>,
}

impl RecordingMailer {
    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .map(|message| message.subject)
            .collect()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, message: MailMessage) -> Result<SentMail, MailError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push(message);
        Ok(SentMail {
            message_id: format!("msg-{}", sent.len()),
        })
    }
}

/// Database, configuration and collaborators of one test pipeline.
pub struct Harness {
    pub db: DatabaseConnection,
    pub config: AppConfig,
    pub ai: Option<Arc<FakeAi>>,
    pub mailer: Arc<RecordingMailer>,
    pub pipeline: Pipeline,
}

impl Harness {
    /// Pipeline running the AI stages in mock mode.
    pub async fn mock(config: AppConfig) -> Result<Self> {
        Self::build(config, None, setup_test_db().await?)
    }

    /// Mock-mode pipeline on a multi-connection file database.
    pub async fn mock_on_file(config: AppConfig, dir: &TempDir) -> Result<Self> {
        Self::build(config, None, setup_file_db(dir, 4).await?)
    }

    /// Pipeline backed by a scripted [`FakeAi`].
    pub async fn with_ai(config: AppConfig) -> Result<Self> {
        Self::build(config, Some(Arc::new(FakeAi::default())), setup_test_db().await?)
    }

    fn build(config: AppConfig, ai: Option<Arc<FakeAi>>, db: DatabaseConnection) -> Result<Self> {
        let mailer = Arc::new(RecordingMailer::default());
        let pipeline = Pipeline::new(db.clone(), &config, collaborators(&db, &ai, &mailer));
        Ok(Self {
            db,
            config,
            ai,
            mailer,
            pipeline,
        })
    }

    pub fn ai(&self) -> &FakeAi {
        self.ai.as_deref().expect("harness built without AI")
    }

    pub fn queue(&self) -> &JobQueue {
        self.pipeline.queue()
    }

    /// Dispatcher whose registry replaces the standard handler for `handler.job_type()`.
    pub fn dispatcher_with(&self, handler: Arc<dyn JobHandler>) -> Dispatcher {
        let collaborators = collaborators(&self.db, &self.ai, &self.mailer);
        let mailer: Arc<dyn Mailer> = self.mailer.clone();
        let notifier = Notifier::new(
            NotificationLogRepository::new(self.db.clone()),
            mailer,
            &self.config.notifications,
        );
        let queue = JobQueue::new(
            self.db.clone(),
            QueueSettings::from_config(&self.config),
            notifier.clone(),
        );
        let deps = HandlerDeps::from_config(
            &self.config,
            collaborators.ai,
            collaborators.prompts,
            collaborators.seeder,
            collaborators.workbook,
            notifier,
            self.db.clone(),
        );
        let mut registry = HandlerRegistry::standard(deps);
        registry.register(handler);
        Dispatcher::new(
            queue,
            RateLimiter::from_config(self.db.clone(), &self.config),
            registry,
            &self.config.dispatcher,
        )
    }

    /// Runs ticks until one attempts nothing, returning the stats of every tick.
    pub async fn drain(&self, dispatcher: &Dispatcher) -> Result<Vec<DispatcherRunStats>> {
        let mut ticks = Vec::new();
        for _ in 0..30 {
            let stats = dispatcher.run_once(options()).await?;
            let idle = stats.attempted == 0;
            ticks.push(stats);
            if idle {
                break;
            }
        }
        Ok(ticks)
    }

    pub async fn upload(&self, id: Uuid) -> Result<upload::Model> {
        Ok(Upload::find_by_id(id).one(&self.db).await?.expect("upload"))
    }

    pub async fn batch(&self, id: Uuid) -> Result<batch::Model> {
        Ok(Batch::find_by_id(id).one(&self.db).await?.expect("batch"))
    }

    pub async fn job(&self, id: Uuid) -> Result<job::Model> {
        Ok(Job::find_by_id(id).one(&self.db).await?.expect("job"))
    }
}

fn collaborators(
    db: &DatabaseConnection,
    ai: &Option<Arc<FakeAi>>,
    mailer: &Arc<RecordingMailer>,
) -> Collaborators {
    Collaborators {
        ai: ai.clone().map(|ai| ai as Arc<dyn AiClient>),
        mailer: mailer.clone(),
        seeder: Arc::new(DatabaseSeeder::new(db.clone())),
        workbook: Arc::new(CsvWorkbookWriter),
        prompts: Arc::new(PromptSet::default()),
    }
}
