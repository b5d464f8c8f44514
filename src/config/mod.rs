//! Configuration loading for the intake pipeline.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `INTAKE_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

const ENV_PREFIX: &str = "INTAKE_";
const REDACTED: &str = "[REDACTED]";

/// Application configuration derived from `INTAKE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operator_tokens: Vec<String>,
    #[serde(default)]
    pub ai: AiConfig,
    /// Per-model limits keyed by [`model_env_key`]
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub model_limits: BTreeMap<String, ModelLimits>,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

/// Generative-AI integration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AiConfig {
    /// When false, AI stages return deterministic mock payloads
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default = "default_ai_api_base")]
    pub api_base: String,
    #[serde(default = "default_analyze_models")]
    pub analyze_models: Vec<String>,
    #[serde(default = "default_analyze_fallback_models")]
    pub analyze_fallback_models: Vec<String>,
    #[serde(default = "default_structure_models")]
    pub structure_models: Vec<String>,
    #[serde(default = "default_structure_fallback_models")]
    pub structure_fallback_models: Vec<String>,
    #[serde(default = "default_ai_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_ai_temperature")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_budget: Option<i32>,
    #[serde(default)]
    pub search_enabled: bool,
    #[serde(default = "default_ai_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    /// Rows included in a single prompt
    #[serde(default = "default_max_rows_per_batch")]
    pub max_rows_per_batch: usize,
    /// Directory overriding the built-in prompt templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_dir: Option<PathBuf>,
}

/// Static usage limits for one model. Unset fields are unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct ModelLimits {
    /// Requests per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpm: Option<u32>,
    /// Request tokens per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<u64>,
    /// Requests per day
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpd: Option<u32>,
    /// Batch tokens per minute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_tokens: Option<u64>,
}

impl ModelLimits {
    pub fn is_unlimited(&self) -> bool {
        self.rpm.is_none() && self.tpm.is_none() && self.rpd.is_none() && self.batch_tokens.is_none()
    }
}

/// Dispatcher tick settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DispatcherConfig {
    #[serde(default = "default_dispatcher_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_dispatcher_max_jobs")]
    pub max_jobs: u64,
    #[serde(default = "default_dispatcher_time_budget_ms")]
    pub time_budget_ms: u64,
    #[serde(default = "default_dispatcher_tick_seconds")]
    pub tick_seconds: u64,
    #[serde(default = "default_dispatcher_stale_timeout_seconds")]
    pub stale_timeout_seconds: u64,
    #[serde(default = "default_dispatcher_window_retention_hours")]
    pub window_retention_hours: u64,
    /// Run the dispatch loop inside `serve`
    #[serde(default = "default_true")]
    pub loop_enabled: bool,
}

/// Retry policy for failed jobs.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct RetryPolicyConfig {
    /// Base retry interval in seconds (default: 30)
    ///
    /// Backoff after the n-th failure is `base_seconds * 2^(n-1)`, capped at `max_seconds`.
    ///
    /// Environment variable: `INTAKE_RETRY_BASE_SECONDS`
    #[serde(default = "default_retry_base_seconds")]
    #[schema(example = 30)]
    pub base_seconds: u64,

    /// Maximum retry interval in seconds (default: 1800)
    ///
    /// Environment variable: `INTAKE_RETRY_MAX_SECONDS`
    #[serde(default = "default_retry_max_seconds")]
    #[schema(example = 1800)]
    pub max_seconds: u64,

    /// Jitter factor (default: 0.1, range: 0.0-1.0)
    ///
    /// Environment variable: `INTAKE_RETRY_JITTER_FACTOR`
    #[serde(default = "default_retry_jitter_factor")]
    #[schema(example = 0.1, minimum = 0.0, maximum = 1.0)]
    pub jitter_factor: f64,

    /// Attempts allowed for ANALYZE and STRUCTURE jobs
    ///
    /// Environment variable: `INTAKE_JOB_MAX_RETRIES`
    #[serde(default = "default_job_max_retries")]
    pub max_retries: u32,

    /// Attempts allowed for INSERT, WORKBOOK and NOTIFICATION jobs
    ///
    /// Environment variable: `INTAKE_JOB_MAX_RETRIES_LOCAL`
    #[serde(default = "default_job_max_retries_local")]
    pub max_retries_local: u32,
}

/// Mail delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct NotificationConfig {
    #[serde(default = "default_mail_from")]
    pub mail_from: String,
    /// Operational address copied on every notification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ops_address: Option<String>,
    /// Without a host, mail is written to the log instead of sent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp_password: Option<String>,
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            operator_tokens: Vec::new(),
            ai: AiConfig::default(),
            model_limits: default_model_limits(),
            dispatcher: DispatcherConfig::default(),
            retry: RetryPolicyConfig::default(),
            notifications: NotificationConfig::default(),
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            api_base: default_ai_api_base(),
            analyze_models: default_analyze_models(),
            analyze_fallback_models: default_analyze_fallback_models(),
            structure_models: default_structure_models(),
            structure_fallback_models: default_structure_fallback_models(),
            max_output_tokens: default_ai_max_output_tokens(),
            temperature: default_ai_temperature(),
            thinking_budget: None,
            search_enabled: false,
            request_timeout_seconds: default_ai_request_timeout_seconds(),
            max_rows_per_batch: default_max_rows_per_batch(),
            prompt_dir: None,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            concurrency: default_dispatcher_concurrency(),
            max_jobs: default_dispatcher_max_jobs(),
            time_budget_ms: default_dispatcher_time_budget_ms(),
            tick_seconds: default_dispatcher_tick_seconds(),
            stale_timeout_seconds: default_dispatcher_stale_timeout_seconds(),
            window_retention_hours: default_dispatcher_window_retention_hours(),
            loop_enabled: true,
        }
    }
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_seconds: default_retry_base_seconds(),
            max_seconds: default_retry_max_seconds(),
            jitter_factor: default_retry_jitter_factor(),
            max_retries: default_job_max_retries(),
            max_retries_local: default_job_max_retries_local(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mail_from: default_mail_from(),
            ops_address: None,
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            public_base_url: default_public_base_url(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    pub fn is_production(&self) -> bool {
        self.profile == "production"
    }

    /// Limits for a model; unknown models are unlimited.
    pub fn limits_for(&self, model: &str) -> ModelLimits {
        self.model_limits
            .get(&model_env_key(model))
            .copied()
            .unwrap_or_default()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if !config.operator_tokens.is_empty() {
            config.operator_tokens = vec![REDACTED.to_string()];
        }
        if config.ai.api_key.is_some() {
            config.ai.api_key = Some(REDACTED.to_string());
        }
        if config.notifications.smtp_password.is_some() {
            config.notifications.smtp_password = Some(REDACTED.to_string());
        }
        if config.database_url.contains('@') {
            config.database_url = REDACTED.to_string();
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.profile.as_str(), "local" | "test") && self.operator_tokens.is_empty() {
            return Err(ConfigError::MissingOperatorTokens);
        }

        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            return Err(ConfigError::InvalidLogFormat {
                value: self.log_format.clone(),
            });
        }

        self.ai.validate()?;
        validate_http_url("INTAKE_PUBLIC_BASE_URL", &self.notifications.public_base_url)?;
        self.dispatcher.validate()?;
        self.retry.validate()?;

        for (model, limits) in &self.model_limits {
            let zero = limits.rpm == Some(0)
                || limits.tpm == Some(0)
                || limits.rpd == Some(0)
                || limits.batch_tokens == Some(0);
            if zero {
                return Err(ConfigError::InvalidModelLimit {
                    model: model.clone(),
                });
            }
        }

        Ok(())
    }
}

impl AiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.api_key.as_deref().is_none_or(str::is_empty) {
            return Err(ConfigError::MissingAiApiKey);
        }
        if self.analyze_models.is_empty() && self.analyze_fallback_models.is_empty() {
            return Err(ConfigError::MissingModels { stage: "analyze" });
        }
        if self.structure_models.is_empty() && self.structure_fallback_models.is_empty() {
            return Err(ConfigError::MissingModels { stage: "structure" });
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::InvalidTemperature {
                value: self.temperature,
            });
        }
        if self.max_rows_per_batch == 0 {
            return Err(ConfigError::InvalidMaxRows);
        }
        validate_http_url("INTAKE_AI_API_BASE", &self.api_base)
    }
}

fn validate_http_url(key: &'static str, value: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        key,
        value: value.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            key,
            value: value.to_string(),
        });
    }
    Ok(())
}

impl DispatcherConfig {
    /// Validate dispatcher bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=32).contains(&self.concurrency) {
            return Err(ConfigError::InvalidDispatcherConcurrency {
                value: self.concurrency,
            });
        }
        if self.max_jobs == 0 {
            return Err(ConfigError::InvalidDispatcherMaxJobs);
        }
        if self.time_budget_ms < 1_000 {
            return Err(ConfigError::InvalidDispatcherTimeBudget {
                value: self.time_budget_ms,
            });
        }
        if self.tick_seconds == 0 {
            return Err(ConfigError::InvalidDispatcherTick);
        }
        if self.stale_timeout_seconds < 60 {
            return Err(ConfigError::InvalidStaleTimeout {
                value: self.stale_timeout_seconds,
            });
        }
        Ok(())
    }
}

impl RetryPolicyConfig {
    /// Validate retry policy bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_seconds > self.max_seconds {
            return Err(ConfigError::InvalidRetryBounds {
                base: self.base_seconds,
                max: self.max_seconds,
            });
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::InvalidRetryJitter {
                value: self.jitter_factor,
            });
        }
        if self.max_retries == 0 || self.max_retries_local == 0 {
            return Err(ConfigError::InvalidMaxRetries);
        }
        Ok(())
    }
}

/// Normalizes a model name to its environment key form (`gemini-2.5-pro` -> `GEMINI_2_5_PRO`).
pub fn model_env_key(model: &str) -> String {
    model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://intake.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_ai_api_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}

fn default_analyze_models() -> Vec<String> {
    vec!["gemini-2.5-flash".to_string()]
}

fn default_analyze_fallback_models() -> Vec<String> {
    vec!["gemini-2.5-flash-lite".to_string()]
}

fn default_structure_models() -> Vec<String> {
    vec!["gemini-2.5-pro".to_string()]
}

fn default_structure_fallback_models() -> Vec<String> {
    vec!["gemini-2.5-flash".to_string()]
}

fn default_ai_max_output_tokens() -> u32 {
    8_192
}

fn default_ai_temperature() -> f32 {
    0.2
}

fn default_ai_request_timeout_seconds() -> u64 {
    120
}

fn default_max_rows_per_batch() -> usize {
    200
}

const PRODUCTION_MAX_ROWS_PER_BATCH: usize = 50;

fn default_model_limits() -> BTreeMap<String, ModelLimits> {
    BTreeMap::from([
        (
            model_env_key("gemini-2.5-pro"),
            ModelLimits {
                rpm: Some(150),
                tpm: Some(2_000_000),
                rpd: Some(10_000),
                batch_tokens: None,
            },
        ),
        (
            model_env_key("gemini-2.5-flash"),
            ModelLimits {
                rpm: Some(1_000),
                tpm: Some(1_000_000),
                rpd: Some(10_000),
                batch_tokens: None,
            },
        ),
        (
            model_env_key("gemini-2.5-flash-lite"),
            ModelLimits {
                rpm: Some(4_000),
                tpm: Some(4_000_000),
                rpd: None,
                batch_tokens: None,
            },
        ),
    ])
}

fn default_dispatcher_concurrency() -> usize {
    3
}

fn default_dispatcher_max_jobs() -> u64 {
    25
}

fn default_dispatcher_time_budget_ms() -> u64 {
    50_000
}

fn default_dispatcher_tick_seconds() -> u64 {
    60
}

fn default_dispatcher_stale_timeout_seconds() -> u64 {
    600
}

fn default_dispatcher_window_retention_hours() -> u64 {
    48
}

fn default_retry_base_seconds() -> u64 {
    30
}

fn default_retry_max_seconds() -> u64 {
    1_800
}

fn default_retry_jitter_factor() -> f64 {
    0.1
}

fn default_job_max_retries() -> u32 {
    5
}

fn default_job_max_retries_local() -> u32 {
    3
}

fn default_mail_from() -> String {
    "Candidate Intake <intake@localhost>".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_public_base_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_true() -> bool {
    true
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },
    #[error("no operator tokens configured; set INTAKE_OPERATOR_TOKENS")]
    MissingOperatorTokens,
    #[error("log format must be 'json' or 'pretty', got '{value}'")]
    InvalidLogFormat { value: String },
    #[error("AI is enabled but no API key is set; set INTAKE_AI_API_KEY")]
    MissingAiApiKey,
    #[error("no {stage} models configured")]
    MissingModels { stage: &'static str },
    #[error("AI temperature must be between 0.0 and 2.0, got {value}")]
    InvalidTemperature { value: f32 },
    #[error("AI max rows per batch must be positive")]
    InvalidMaxRows,
    #[error("rate limits for model {model} must be positive when set")]
    InvalidModelLimit { model: String },
    #[error("dispatcher concurrency must be between 1 and 32, got {value}")]
    InvalidDispatcherConcurrency { value: usize },
    #[error("dispatcher max jobs must be positive")]
    InvalidDispatcherMaxJobs,
    #[error("dispatcher time budget must be at least 1000 ms, got {value}")]
    InvalidDispatcherTimeBudget { value: u64 },
    #[error("dispatcher tick interval must be positive")]
    InvalidDispatcherTick,
    #[error("stale job timeout must be at least 60 seconds, got {value}")]
    InvalidStaleTimeout { value: u64 },
    #[error("retry base seconds ({base}) cannot be greater than max seconds ({max})")]
    InvalidRetryBounds { base: u64, max: u64 },
    #[error("retry jitter factor must be between 0.0 and 1.0, got {value}")]
    InvalidRetryJitter { value: f64 },
    #[error("job max retries must be positive")]
    InvalidMaxRetries,
    #[error("{key} must be an http(s) URL, got '{value}'")]
    InvalidUrl { key: &'static str, value: String },
}

/// Loads configuration using layered `.env` files and `INTAKE_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads, merges and validates configuration.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                layered.insert(stripped.to_string(), value);
            }
        }

        let mut values = Layered(layered);
        let profile = values.string("PROFILE").unwrap_or(profile_hint);
        let production = profile == "production";

        let ai = AiConfig {
            enabled: values.parsed("AI_ENABLED")?.unwrap_or(false),
            api_key: values.string("AI_API_KEY"),
            api_base: values
                .string("AI_API_BASE")
                .unwrap_or_else(default_ai_api_base),
            analyze_models: values
                .list("AI_ANALYZE_MODELS")
                .unwrap_or_else(default_analyze_models),
            analyze_fallback_models: values
                .list("AI_ANALYZE_FALLBACK_MODELS")
                .unwrap_or_else(default_analyze_fallback_models),
            structure_models: values
                .list("AI_STRUCTURE_MODELS")
                .unwrap_or_else(default_structure_models),
            structure_fallback_models: values
                .list("AI_STRUCTURE_FALLBACK_MODELS")
                .unwrap_or_else(default_structure_fallback_models),
            max_output_tokens: values
                .parsed("AI_MAX_OUTPUT_TOKENS")?
                .unwrap_or_else(default_ai_max_output_tokens),
            temperature: values
                .parsed("AI_TEMPERATURE")?
                .unwrap_or_else(default_ai_temperature),
            thinking_budget: values.parsed("AI_THINKING_BUDGET")?,
            search_enabled: values.parsed("AI_SEARCH_ENABLED")?.unwrap_or(false),
            request_timeout_seconds: values
                .parsed("AI_REQUEST_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_ai_request_timeout_seconds),
            max_rows_per_batch: values.parsed("AI_MAX_ROWS_PER_BATCH")?.unwrap_or(
                if production {
                    PRODUCTION_MAX_ROWS_PER_BATCH
                } else {
                    default_max_rows_per_batch()
                },
            ),
            prompt_dir: values.string("PROMPT_DIR").map(PathBuf::from),
        };

        let dispatcher = DispatcherConfig {
            concurrency: values
                .parsed("DISPATCHER_CONCURRENCY")?
                .unwrap_or_else(default_dispatcher_concurrency),
            max_jobs: values
                .parsed("DISPATCHER_MAX_JOBS")?
                .unwrap_or_else(default_dispatcher_max_jobs),
            time_budget_ms: values
                .parsed("DISPATCHER_TIME_BUDGET_MS")?
                .unwrap_or_else(default_dispatcher_time_budget_ms),
            tick_seconds: values
                .parsed("DISPATCHER_TICK_SECONDS")?
                .unwrap_or_else(default_dispatcher_tick_seconds),
            stale_timeout_seconds: values
                .parsed("DISPATCHER_STALE_TIMEOUT_SECONDS")?
                .unwrap_or_else(default_dispatcher_stale_timeout_seconds),
            window_retention_hours: values
                .parsed("DISPATCHER_WINDOW_RETENTION_HOURS")?
                .unwrap_or_else(default_dispatcher_window_retention_hours),
            loop_enabled: values.parsed("DISPATCHER_LOOP_ENABLED")?.unwrap_or(true),
        };

        let retry = RetryPolicyConfig {
            base_seconds: values
                .parsed("RETRY_BASE_SECONDS")?
                .unwrap_or_else(default_retry_base_seconds),
            max_seconds: values
                .parsed("RETRY_MAX_SECONDS")?
                .unwrap_or_else(default_retry_max_seconds),
            jitter_factor: values
                .parsed("RETRY_JITTER_FACTOR")?
                .unwrap_or_else(default_retry_jitter_factor),
            max_retries: values
                .parsed("JOB_MAX_RETRIES")?
                .unwrap_or_else(default_job_max_retries),
            max_retries_local: values
                .parsed("JOB_MAX_RETRIES_LOCAL")?
                .unwrap_or_else(default_job_max_retries_local),
        };

        let notifications = NotificationConfig {
            mail_from: values.string("MAIL_FROM").unwrap_or_else(default_mail_from),
            ops_address: values.string("MAIL_OPS_ADDRESS"),
            smtp_host: values.string("SMTP_HOST"),
            smtp_port: values
                .parsed("SMTP_PORT")?
                .unwrap_or_else(default_smtp_port),
            smtp_username: values.string("SMTP_USERNAME"),
            smtp_password: values.string("SMTP_PASSWORD"),
            public_base_url: values
                .string("PUBLIC_BASE_URL")
                .unwrap_or_else(default_public_base_url),
        };

        let config = AppConfig {
            profile,
            api_bind_addr: values
                .string("API_BIND_ADDR")
                .unwrap_or_else(default_api_bind_addr),
            log_level: values.string("LOG_LEVEL").unwrap_or_else(default_log_level),
            log_format: values
                .string("LOG_FORMAT")
                .unwrap_or_else(default_log_format),
            database_url: values
                .string("DATABASE_URL")
                .unwrap_or_else(default_database_url),
            db_max_connections: values
                .parsed("DB_MAX_CONNECTIONS")?
                .unwrap_or_else(default_db_max_connections),
            db_acquire_timeout_ms: values
                .parsed("DB_ACQUIRE_TIMEOUT_MS")?
                .unwrap_or_else(default_db_acquire_timeout_ms),
            operator_tokens: values.list("OPERATOR_TOKENS").unwrap_or_default(),
            model_limits: values.model_limits()?,
            ai,
            dispatcher,
            retry,
            notifications,
        };

        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var(format!("{ENV_PREFIX}PROFILE"))
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Merged key/value layer with typed accessors. Keys are consumed on read.
struct Layered(BTreeMap<String, String>);

impl Layered {
    fn string(&mut self, key: &str) -> Option<String> {
        self.0
            .remove(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn parsed<T: FromStr>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            None => Ok(None),
            Some(value) => value
                .parse()
                .map(Some)
                .map_err(|_| ConfigError::InvalidValue {
                    key: format!("{ENV_PREFIX}{key}"),
                    value,
                }),
        }
    }

    fn list(&mut self, key: &str) -> Option<Vec<String>> {
        self.string(key).map(|value| {
            value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }

    /// Collects `RATE_LIMIT_MODEL_<NAME>_{RPM,TPM,RPD,BATCH_TOKENS}` over the built-in defaults.
    fn model_limits(&mut self) -> Result<BTreeMap<String, ModelLimits>, ConfigError> {
        let mut limits = default_model_limits();
        let keys: Vec<String> = self
            .0
            .keys()
            .filter(|key| key.starts_with("RATE_LIMIT_MODEL_"))
            .cloned()
            .collect();

        for key in keys {
            let Some(rest) = key.strip_prefix("RATE_LIMIT_MODEL_") else {
                continue;
            };
            let (model, setting) = if let Some(model) = rest.strip_suffix("_BATCH_TOKENS") {
                (model, "BATCH_TOKENS")
            } else if let Some(model) = rest.strip_suffix("_RPM") {
                (model, "RPM")
            } else if let Some(model) = rest.strip_suffix("_TPM") {
                (model, "TPM")
            } else if let Some(model) = rest.strip_suffix("_RPD") {
                (model, "RPD")
            } else {
                continue;
            };
            let model = model_env_key(model);
            let setting = setting.to_string();

            let entry = limits.entry(model).or_default();
            match setting.as_str() {
                "RPM" => entry.rpm = self.parsed(&key)?,
                "TPM" => entry.tpm = self.parsed(&key)?,
                "RPD" => entry.rpd = self.parsed(&key)?,
                _ => entry.batch_tokens = self.parsed(&key)?,
            }
        }

        Ok(limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_validation() {
        assert!(RetryPolicyConfig::default().validate().is_ok());

        let invalid_bounds = RetryPolicyConfig {
            base_seconds: 1000,
            max_seconds: 500,
            ..RetryPolicyConfig::default()
        };
        assert!(invalid_bounds.validate().is_err());

        let invalid_jitter = RetryPolicyConfig {
            jitter_factor: 1.5,
            ..RetryPolicyConfig::default()
        };
        assert!(invalid_jitter.validate().is_err());
    }

    #[test]
    fn test_dispatcher_concurrency_bounds() {
        let mut config = DispatcherConfig::default();
        assert!(config.validate().is_ok());

        config.concurrency = 0;
        assert!(config.validate().is_err());

        config.concurrency = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_enabled_ai_requires_key() {
        let mut ai = AiConfig {
            enabled: true,
            ..AiConfig::default()
        };
        assert!(matches!(ai.validate(), Err(ConfigError::MissingAiApiKey)));

        ai.api_key = Some("secret".into());
        assert!(ai.validate().is_ok());
    }

    #[test]
    fn test_operator_tokens_required_outside_local() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.profile = "production".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingOperatorTokens)
        ));
    }

    #[test]
    fn test_model_env_key_and_limits_lookup() {
        assert_eq!(model_env_key("gemini-2.5-pro"), "GEMINI_2_5_PRO");

        let config = AppConfig::default();
        assert_eq!(config.limits_for("gemini-2.5-pro").rpm, Some(150));
        assert!(config.limits_for("unknown-model").is_unlimited());
    }

    #[test]
    fn test_redacted_json_hides_secrets() {
        let mut config = AppConfig::default();
        config.operator_tokens = vec!["op-secret".into()];
        config.ai.api_key = Some("ai-secret".into());
        config.notifications.smtp_password = Some("smtp-secret".into());

        let json = config.redacted_json().unwrap();
        assert!(!json.contains("op-secret"));
        assert!(!json.contains("ai-secret"));
        assert!(!json.contains("smtp-secret"));
        assert!(json.contains(REDACTED));
    }

    #[test]
    fn test_model_limit_keys_parse() {
        let mut layered = Layered(BTreeMap::from([
            ("RATE_LIMIT_MODEL_M1_RPM".to_string(), "2".to_string()),
            (
                "RATE_LIMIT_MODEL_M1_BATCH_TOKENS".to_string(),
                "5000".to_string(),
            ),
        ]));
        let limits = layered.model_limits().unwrap();
        let m1 = limits.get("M1").unwrap();
        assert_eq!(m1.rpm, Some(2));
        assert_eq!(m1.batch_tokens, Some(5000));
        assert_eq!(m1.tpm, None);
    }

    #[test]
    fn test_base_urls_must_be_http() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.notifications.public_base_url = "intake.example.gov".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidUrl { key: "INTAKE_PUBLIC_BASE_URL", .. })
        ));

        let mut ai = AiConfig::default();
        ai.api_base = "ftp://models.example".into();
        assert!(matches!(ai.validate(), Err(ConfigError::InvalidUrl { .. })));
    }
}
