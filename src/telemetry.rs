//! Telemetry: global subscriber management, task-scoped trace ids and metric names.

use std::any::type_name_of_val;
use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use thiserror::Error;
use tokio::task_local;
use tracing_log::LogTracer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::Layer,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

use crate::config::AppConfig;

/// Counter of finished dispatch attempts, labelled by `outcome`.
pub const METRIC_DISPATCHER_JOBS: &str = "dispatcher_jobs_total";
/// Counter of rejected reservations, labelled by `model`.
pub const METRIC_DISPATCHER_RATE_LIMITED: &str = "dispatcher_rate_limited_total";
/// Histogram of tick wall time in milliseconds.
pub const METRIC_DISPATCHER_TICK_DURATION: &str = "dispatcher_tick_duration_ms";
/// Counter of compare-and-increment conflicts in the rate limiter.
pub const METRIC_RATE_LIMITER_CONFLICTS: &str = "rate_limiter_conflicts_total";
/// Counter of notification deliveries, labelled by `type` and `status`.
pub const METRIC_NOTIFICATIONS: &str = "notifications_total";

/// Trace context carrying the correlation id of a request or dispatcher tick.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: String,
}

impl TraceContext {
    /// Fresh context with a random id, used for work not started by a request.
    pub fn generate(prefix: &str) -> Self {
        Self {
            trace_id: format!("{prefix}-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

task_local! {
    static ACTIVE_TRACE_CONTEXT: TraceContext;
}

/// Errors that can occur while initializing global telemetry.
#[derive(Debug, Error)]
pub enum TelemetryInitError {
    #[error("failed to install log tracer bridge: {0}")]
    LogTracer(#[from] log::SetLoggerError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
}

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Initialize global tracing/logging exactly once, wiring `log::` macros into the tracing pipeline.
pub fn init_tracing(config: &AppConfig) -> Result<(), TelemetryInitError> {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(());
    }

    // sqlx logs through `log`; bridge it before the subscriber goes in.
    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        let logger_type = type_name_of_val(log::logger());
        if !logger_type.contains("LogTracer") {
            eprintln!(
                "Warning: Failed to install log tracer bridge: {}. `log::` records will not reach the subscriber.",
                err
            );
        }
    }

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let fmt_layer = match config.log_format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        _ => fmt::layer().json().boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!(
            "Warning: Failed to set global tracing subscriber: {}. Default subscriber remains in effect.",
            err
        );
    }

    describe_metrics();

    Ok(())
}

/// Registers descriptions with whatever metrics recorder is installed.
pub fn describe_metrics() {
    metrics::describe_counter!(
        METRIC_DISPATCHER_JOBS,
        "Dispatch attempts by outcome (succeeded, failed, skipped)"
    );
    metrics::describe_counter!(
        METRIC_DISPATCHER_RATE_LIMITED,
        "Capacity reservations rejected by the rate limiter"
    );
    metrics::describe_histogram!(
        METRIC_DISPATCHER_TICK_DURATION,
        metrics::Unit::Milliseconds,
        "Wall time of one dispatcher tick"
    );
    metrics::describe_counter!(
        METRIC_RATE_LIMITER_CONFLICTS,
        "Concurrent update conflicts while reserving rate capacity"
    );
    metrics::describe_counter!(
        METRIC_NOTIFICATIONS,
        "Notification deliveries by type and status"
    );
}

/// Execute `future` within the provided trace context, making it available through task-local
/// storage for the duration of the request or tick.
pub async fn with_trace_context<Fut, R>(context: TraceContext, future: Fut) -> R
where
    Fut: std::future::Future<Output = R>,
{
    ACTIVE_TRACE_CONTEXT.scope(context, future).await
}

/// Get the currently active trace ID, if one has been set for the running task.
pub fn current_trace_id() -> Option<String> {
    ACTIVE_TRACE_CONTEXT
        .try_with(|ctx| ctx.trace_id.clone())
        .ok()
}
