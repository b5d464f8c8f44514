//! # Server Configuration
//!
//! Router, shared state and the serve loop for the operator API. When enabled, the
//! dispatcher loop runs next to the HTTP server and stops with it.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::Request,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use utoipa_swagger_ui::SwaggerUi;

use crate::auth::auth_middleware;
use crate::config::AppConfig;
use crate::handlers;
use crate::pipeline::Pipeline;
use crate::telemetry::{TraceContext, with_trace_context};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub pipeline: Pipeline,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    let protected = Router::new()
        .route("/uploads", post(handlers::uploads::create_upload))
        .route("/uploads/{upload_id}", get(handlers::uploads::get_upload))
        .route(
            "/uploads/{upload_id}/batches/{batch_id}/retry",
            post(handlers::uploads::retry_batch),
        )
        .route(
            "/uploads/{upload_id}/batches/{batch_id}/skip",
            post(handlers::uploads::skip_batch),
        )
        .route("/jobs/{job_id}/skip", post(handlers::jobs::skip_job))
        .route("/dispatch", post(handlers::dispatch::run_dispatch))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.config),
            auth_middleware,
        ));

    Router::new()
        .route("/", get(handlers::root))
        .route("/healthz", get(handlers::healthz))
        .merge(protected)
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
        .layer(middleware::from_fn(trace_context_middleware))
        .layer(TraceLayer::new_for_http())
}

/// Runs each request under a trace id taken from `x-request-id` or freshly generated.
async fn trace_context_middleware(mut request: Request, next: Next) -> Response {
    let context = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty() && value.len() <= 128)
        .map(|value| TraceContext {
            trace_id: value.to_string(),
        })
        .unwrap_or_else(|| TraceContext::generate("req"));
    request.extensions_mut().insert(context.clone());
    with_trace_context(context, next.run(request)).await
}

/// Serves the API until ctrl-c, running the dispatcher loop alongside when configured.
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    pipeline: Pipeline,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;

    let shutdown = CancellationToken::new();
    let dispatch_loop = config.dispatcher.loop_enabled.then(|| {
        let dispatcher = pipeline.dispatcher().clone();
        let interval = Duration::from_secs(config.dispatcher.tick_seconds);
        let options = pipeline.default_options();
        tokio::spawn(dispatcher.run_loop(interval, options, shutdown.child_token()))
    });

    let state = AppState {
        config: Arc::new(config),
        db,
        pipeline,
    };
    let profile = state.config.profile.clone();
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, %profile, "Server listening");

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Some(handle) = dispatch_loop {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "Dispatcher loop ended abnormally");
        }
    }
    Ok(())
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer_auth",
            SecurityScheme::Http(HttpBuilder::new().scheme(HttpAuthScheme::Bearer).build()),
        );
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::healthz,
        crate::handlers::uploads::create_upload,
        crate::handlers::uploads::get_upload,
        crate::handlers::uploads::retry_batch,
        crate::handlers::uploads::skip_batch,
        crate::handlers::jobs::skip_job,
        crate::handlers::dispatch::run_dispatch,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::handlers::HealthResponse,
            crate::handlers::uploads::CreateUploadRequest,
            crate::handlers::uploads::CreateUploadResponse,
            crate::handlers::uploads::BatchSummary,
            crate::handlers::uploads::SkipRequest,
            crate::handlers::jobs::JobInfo,
            crate::dispatcher::DispatcherRunStats,
            crate::dispatcher::DispatchError,
            crate::repositories::UploadProgress,
            crate::repositories::BatchProgress,
            crate::repositories::JobProgress,
            crate::payload::RawRow,
            crate::payload::UploadSummary,
            crate::error::ApiError,
        )
    ),
    modifiers(&SecurityAddon),
    info(
        title = "Candidate Intake API",
        description = "Operator API for the spreadsheet intake pipeline",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
