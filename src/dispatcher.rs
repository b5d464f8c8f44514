//! # Dispatcher
//!
//! One tick reclaims stale work, fetches a bounded list of due jobs and drains it with a
//! small pool of async workers sharing an index cursor. Each AI job walks its model list
//! (preferred, then fallback): rejected reservations reschedule the job and move on to the
//! next model, an admitted reservation claims the job and runs its handler. A failed call only
//! escalates to the next model when the upstream asked for a delayed retry.
//!
//! Ticks may overlap across processes; the queue's conditional claim keeps that safe.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::{JobError, PipelineError};
use crate::jobs::{HandlerRegistry, JobContext};
use crate::models::job;
use crate::payload::JobOutput;
use crate::rate_limiter::{RateLimiter, Reservation, UsageRequest};
use crate::repositories::{FailureOutcome, JobQueue};
use crate::telemetry::{
    METRIC_DISPATCHER_JOBS, METRIC_DISPATCHER_RATE_LIMITED, METRIC_DISPATCHER_TICK_DURATION,
    TraceContext, with_trace_context,
};

/// Pseudo-model recorded on attempts of jobs that do not call the AI service.
pub const LOCAL_MODEL: &str = "local";

/// Per-tick limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOptions {
    pub max_jobs: u64,
    pub time_budget: Duration,
    pub concurrency: usize,
}

impl DispatchOptions {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            max_jobs: config.max_jobs,
            time_budget: Duration::from_millis(config.time_budget_ms),
            concurrency: config.concurrency,
        }
    }
}

/// One error observed during a tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DispatchError {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub message: String,
}

/// Result of one tick. `errors` is the canonical per-tick error channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DispatcherRunStats {
    /// Jobs a worker picked up
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    /// Jobs left for a later tick, including `budget_skipped`
    pub skipped: u32,
    /// Fetched jobs never picked up because the time budget ran out
    pub budget_skipped: u32,
    /// Rejected capacity reservations
    pub rate_limited: u32,
    pub stale_resets: u32,
    pub errors: Vec<DispatchError>,
}

impl DispatcherRunStats {
    fn merge(&mut self, other: DispatcherRunStats) {
        self.attempted += other.attempted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.rate_limited += other.rate_limited;
        self.errors.extend(other.errors);
    }

    fn record(&mut self, report: JobReport) {
        self.attempted += 1;
        match report.outcome {
            JobOutcome::Succeeded => self.succeeded += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Skipped => self.skipped += 1,
        }
        self.rate_limited += report.rate_limited;
        self.errors.extend(report.errors);
        counter!(METRIC_DISPATCHER_JOBS, "outcome" => report.outcome.as_str()).increment(1);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl JobOutcome {
    fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
            JobOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug)]
struct JobReport {
    outcome: JobOutcome,
    rate_limited: u32,
    errors: Vec<DispatchError>,
}

impl JobReport {
    fn new() -> Self {
        Self {
            outcome: JobOutcome::Skipped,
            rate_limited: 0,
            errors: Vec::new(),
        }
    }

    fn error(&mut self, job_id: Uuid, model: Option<&str>, message: impl Into<String>) {
        self.errors.push(DispatchError {
            job_id,
            model: model.map(str::to_string),
            message: message.into(),
        });
    }

    fn finish(mut self, outcome: JobOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// Result of running one handler under a claimed attempt.
enum Execution {
    Succeeded,
    Failed {
        error: JobError,
        outcome: Option<FailureOutcome>,
    },
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: JobQueue,
    limiter: RateLimiter,
    handlers: Arc<HandlerRegistry>,
    stale_timeout: Duration,
    window_retention: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: JobQueue,
        limiter: RateLimiter,
        handlers: HandlerRegistry,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            limiter,
            handlers: Arc::new(handlers),
            stale_timeout: Duration::from_secs(config.stale_timeout_seconds),
            window_retention: Duration::from_secs(config.window_retention_hours * 3_600),
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Runs one tick under a fresh trace id.
    pub async fn run_once(
        &self,
        options: DispatchOptions,
    ) -> Result<DispatcherRunStats, PipelineError> {
        let context = TraceContext::generate("dispatch");
        with_trace_context(context.clone(), self.tick(options, context)).await
    }

    #[instrument(skip(self, context), fields(trace_id = %context.trace_id, max_jobs = options.max_jobs))]
    async fn tick(
        &self,
        options: DispatchOptions,
        context: TraceContext,
    ) -> Result<DispatcherRunStats, PipelineError> {
        let started = Instant::now();
        let mut stats = DispatcherRunStats {
            stale_resets: self.queue.reset_stale_jobs(self.stale_timeout).await?,
            ..DispatcherRunStats::default()
        };
        if let Err(err) = self.limiter.purge_old_windows(self.window_retention).await {
            warn!(error = %err, "Failed to purge old rate windows");
        }

        let jobs = Arc::new(self.queue.list_dispatchable(options.max_jobs, Utc::now()).await?);
        if jobs.is_empty() {
            debug!(stale_resets = stats.stale_resets, "No dispatchable jobs");
            return Ok(stats);
        }

        let cursor = Arc::new(AtomicUsize::new(0));
        let workers = options.concurrency.clamp(1, jobs.len());
        let mut pool = JoinSet::new();
        for _ in 0..workers {
            let dispatcher = self.clone();
            let jobs = Arc::clone(&jobs);
            let cursor = Arc::clone(&cursor);
            let budget = options.time_budget;
            pool.spawn(with_trace_context(context.clone(), async move {
                dispatcher.worker(jobs, cursor, started, budget).await
            }));
        }

        while let Some(joined) = pool.join_next().await {
            match joined {
                Ok(worker_stats) => stats.merge(worker_stats),
                Err(err) => error!(error = %err, "Dispatcher worker panicked"),
            }
        }

        let picked = stats.attempted as usize;
        let untouched = u32::try_from(jobs.len().saturating_sub(picked)).unwrap_or(u32::MAX);
        stats.budget_skipped = untouched;
        stats.skipped += untouched;
        if untouched > 0 {
            counter!(METRIC_DISPATCHER_JOBS, "outcome" => "budget_skipped")
                .increment(u64::from(untouched));
        }

        let elapsed = started.elapsed();
        histogram!(METRIC_DISPATCHER_TICK_DURATION).record(elapsed.as_secs_f64() * 1_000.0);
        info!(
            fetched = jobs.len(),
            attempted = stats.attempted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            skipped = stats.skipped,
            budget_skipped = stats.budget_skipped,
            rate_limited = stats.rate_limited,
            stale_resets = stats.stale_resets,
            errors = stats.errors.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Dispatcher tick completed"
        );
        Ok(stats)
    }

    async fn worker(
        &self,
        jobs: Arc<Vec<job::Model>>,
        cursor: Arc<AtomicUsize>,
        started: Instant,
        budget: Duration,
    ) -> DispatcherRunStats {
        let mut stats = DispatcherRunStats::default();
        loop {
            if started.elapsed() >= budget {
                break;
            }
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(job) = jobs.get(index) else {
                break;
            };
            let report = self.dispatch_job(job).await;
            stats.record(report);
        }
        stats
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type))]
    async fn dispatch_job(&self, job: &job::Model) -> JobReport {
        let mut report = JobReport::new();
        if self.handlers.get(job.job_type).is_none() {
            report.error(job.id, None, format!("no handler registered for {}", job.job_type));
            return report.finish(JobOutcome::Skipped);
        }

        if !job.job_type.uses_ai() {
            let outcome = match self.execute(job, LOCAL_MODEL, false, None, &mut report).await {
                Some(Execution::Succeeded) => JobOutcome::Succeeded,
                Some(Execution::Failed { .. }) => JobOutcome::Failed,
                None => JobOutcome::Skipped,
            };
            return report.finish(outcome);
        }

        let candidates = model_candidates(job);
        if candidates.is_empty() {
            report.error(job.id, None, "job has no candidate models");
            return report.finish(JobOutcome::Skipped);
        }

        let estimate = UsageRequest {
            request_tokens: i64::from(job.estimated_request_tokens),
            response_tokens: i64::from(job.estimated_response_tokens),
            batch_tokens: i64::from(job.estimated_request_tokens)
                + i64::from(job.estimated_response_tokens),
        };

        let mut earliest_retry: Option<DateTime<Utc>> = None;
        let mut attempted = false;
        for (model, is_fallback) in candidates {
            let window_start = match self.limiter.reserve_capacity(&model, estimate).await {
                Ok(Reservation::Allowed { window_start }) => window_start,
                Ok(Reservation::Rejected { retry_at, reason }) => {
                    report.rate_limited += 1;
                    counter!(METRIC_DISPATCHER_RATE_LIMITED, "model" => model.clone()).increment(1);
                    debug!(model = %model, %reason, retry_at = %retry_at, "Reservation rejected");
                    earliest_retry = Some(earliest_retry.map_or(retry_at, |at| at.min(retry_at)));
                    continue;
                }
                Err(err) => {
                    report.error(job.id, Some(&model), format!("rate limiter error: {err}"));
                    return report.finish(JobOutcome::Skipped);
                }
            };

            attempted = true;
            match self
                .execute(job, &model, is_fallback, Some((window_start, estimate)), &mut report)
                .await
            {
                Some(Execution::Succeeded) => return report.finish(JobOutcome::Succeeded),
                Some(Execution::Failed { error, outcome }) => {
                    let delayed_retry = matches!(outcome, Some(FailureOutcome::Retrying { .. }))
                        && error.retry_after().is_some();
                    if !delayed_retry {
                        return report.finish(JobOutcome::Failed);
                    }
                    debug!(model = %model, "Upstream asked for a delayed retry; trying next model");
                }
                None => {
                    self.refund(&model, window_start, estimate).await;
                    return report.finish(JobOutcome::Skipped);
                }
            }
        }

        // Every model refused capacity: wait for the first one to free up.
        if let (false, Some(retry_at)) = (attempted, earliest_retry) {
            if let Err(err) = self.queue.reschedule(job.id, retry_at).await {
                report.error(job.id, None, format!("reschedule failed: {err}"));
            }
        }
        report.finish(JobOutcome::Skipped)
    }

    /// Claims the job for `model`, runs its handler and records the result.
    ///
    /// Returns `None` when the job could not be claimed.
    async fn execute(
        &self,
        job: &job::Model,
        model: &str,
        is_fallback: bool,
        reservation: Option<(DateTime<Utc>, UsageRequest)>,
        report: &mut JobReport,
    ) -> Option<Execution> {
        let claimed = match self
            .queue
            .claim(job.id, model, is_fallback, reservation.map(|(start, _)| start))
            .await
        {
            Ok(claimed) => claimed,
            Err(PipelineError::JobNotReady { status, .. }) => {
                debug!(model, %status, "Job taken by another worker");
                return None;
            }
            Err(err) => {
                report.error(job.id, Some(model), format!("claim failed: {err}"));
                return None;
            }
        };
        let attempt_id = claimed.attempt.id;
        let ai_model = reservation.map(|_| model.to_string());

        let result = self.run_handler(claimed.job, ai_model).await;
        match result {
            Ok(output) => {
                if let (Some((window_start, estimate)), Some(actual)) = (reservation, output.usage())
                {
                    let request_delta = actual.prompt_tokens - estimate.request_tokens;
                    let response_delta = actual.candidate_tokens - estimate.response_tokens;
                    if let Err(err) = self
                        .limiter
                        .adjust_usage(model, window_start, request_delta, response_delta)
                        .await
                    {
                        warn!(model, error = %err, "Failed to correct rate window usage");
                    }
                }
                match self.queue.record_success(job.id, attempt_id, &output).await {
                    Ok(_) => Some(Execution::Succeeded),
                    Err(err) => {
                        report.error(job.id, Some(model), format!("recording success failed: {err}"));
                        Some(Execution::Failed {
                            error: JobError::transient(err.to_string()),
                            outcome: None,
                        })
                    }
                }
            }
            Err(error) => {
                warn!(model, is_fallback, error = %error, "Job attempt failed");
                report.error(job.id, Some(model), error.to_string());
                let outcome = match self.queue.record_failure(job.id, attempt_id, &error).await {
                    Ok(record) => Some(record.outcome),
                    Err(err) => {
                        report.error(job.id, Some(model), format!("recording failure failed: {err}"));
                        None
                    }
                };
                Some(Execution::Failed { error, outcome })
            }
        }
    }

    async fn run_handler(
        &self,
        job: job::Model,
        model: Option<String>,
    ) -> Result<JobOutput, JobError> {
        let handler = self.handlers.get(job.job_type).ok_or_else(|| {
            JobError::permanent(format!("no handler registered for {}", job.job_type))
        })?;
        let ctx = JobContext::load(self.queue.db(), job, model).await?;
        match timeout(self.stale_timeout, handler.run(&ctx)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::transient(format!(
                "handler exceeded {}s",
                self.stale_timeout.as_secs()
            ))),
        }
    }

    /// Returns an unused reservation's tokens to the window.
    async fn refund(&self, model: &str, window_start: DateTime<Utc>, estimate: UsageRequest) {
        if let Err(err) = self
            .limiter
            .adjust_usage(
                model,
                window_start,
                -estimate.request_tokens,
                -estimate.response_tokens,
            )
            .await
        {
            warn!(model, error = %err, "Failed to refund unused reservation");
        }
    }

    /// Ticks every `interval` until `shutdown` fires.
    #[instrument(skip_all)]
    pub async fn run_loop(
        self,
        interval: Duration,
        options: DispatchOptions,
        shutdown: CancellationToken,
    ) {
        info!(interval_secs = interval.as_secs(), "Starting dispatcher loop");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Dispatcher loop shutdown requested");
                    break;
                }
                _ = sleep(interval) => {
                    if let Err(err) = self.run_once(options).await {
                        error!(error = %err, "Dispatcher tick failed");
                    }
                }
            }
        }
        info!("Dispatcher loop stopped");
    }
}

/// Preferred models then fallback models, each flagged with whether it is a fallback.
/// A name listed twice keeps its first position.
pub fn model_candidates(job: &job::Model) -> Vec<(String, bool)> {
    let preferred = job.preferred_model_names();
    let fallback = job.fallback_model_names();
    let mut candidates: Vec<(String, bool)> = Vec::with_capacity(preferred.len() + fallback.len());
    for (model, is_fallback) in preferred
        .into_iter()
        .map(|model| (model, false))
        .chain(fallback.into_iter().map(|model| (model, true)))
    {
        if !candidates.iter().any(|(seen, _)| *seen == model) {
            candidates.push((model, is_fallback));
        }
    }
    candidates
}
