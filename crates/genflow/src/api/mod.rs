use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::cache::{CacheEntryInfo, CacheStats, ResponseCache};
use crate::error::GatewayError;
use crate::gateway::{sanitize_prompt, AwaitOutcome, Gateway};
use crate::jobs::{JobQueue, JobStatus, JobStore, Metrics};

pub mod models;

use models::{
    CacheClearResponse, CacheInfoQuery, EnqueueRequest, EnqueueResponse, ErrorBody,
    GenerateRequest, GenerateResponse, HealthResponse, JobView, WaitQuery,
};

#[derive(Clone)]
pub struct ApiState {
    pub gateway: Gateway,
    pub store: Arc<dyn JobStore>,
    pub queue: Arc<dyn JobQueue>,
    /// Configured providers in dispatch order.
    pub providers: Arc<Vec<String>>,
    /// (provider, model) pairs in dispatch order; defaults for `/cache/info`.
    pub provider_models: Arc<Vec<(String, String)>>,
    /// `None` when the response cache is disabled.
    pub cache: Option<Arc<ResponseCache>>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/jobs", post(enqueue_job))
        .route("/jobs/:id", get(get_job))
        .route("/jobs/:id/wait", get(wait_job))
        // Metrics
        .route("/metrics", get(metrics))
        .route("/metrics/prom", get(metrics_prom))
        // Response cache
        .route("/cache/stats", get(cache_stats))
        .route("/cache/clear", post(cache_clear))
        .route("/cache/info", get(cache_info))
        // Health
        .route("/health", get(health))
        .with_state(state)
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn error(status: StatusCode, msg: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody { error: msg.into() }))
}

fn internal_err(e: anyhow::Error) -> ApiError {
    tracing::error!(error = %e, "request failed");
    error(StatusCode::INTERNAL_SERVER_ERROR, format!("internal error: {e}"))
}

fn bad_body(rejection: JsonRejection) -> ApiError {
    error(
        StatusCode::BAD_REQUEST,
        format!("invalid request body: {}", rejection.body_text()),
    )
}

fn cache_disabled() -> ApiError {
    error(StatusCode::NOT_FOUND, "response cache is disabled")
}

fn gateway_err(e: GatewayError) -> ApiError {
    match e {
        GatewayError::InvalidPrompt(_) => error(StatusCode::BAD_REQUEST, e.to_string()),
        GatewayError::JobNotFound(_) => error(StatusCode::NOT_FOUND, e.to_string()),
        GatewayError::Store(inner) => internal_err(inner),
    }
}

fn outcome_response(outcome: AwaitOutcome) -> Response {
    let code = match &outcome {
        AwaitOutcome::Finished(job) if job.status == JobStatus::Succeeded => StatusCode::OK,
        AwaitOutcome::Finished(_) => StatusCode::BAD_GATEWAY,
        AwaitOutcome::Pending(_) => StatusCode::ACCEPTED,
    };
    (code, Json(GenerateResponse::from(&outcome))).into_response()
}

pub async fn generate(
    State(state): State<ApiState>,
    body: Result<Json<GenerateRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(body) = body.map_err(bad_body)?;
    let job_id = state
        .gateway
        .enqueue(&body.prompt)
        .await
        .map_err(gateway_err)?;

    let outcome = state
        .gateway
        .await_result(job_id, body.timeout_secs.map(Duration::from_secs))
        .await
        .map_err(gateway_err)?;

    Ok(outcome_response(outcome))
}

pub async fn enqueue_job(
    State(state): State<ApiState>,
    body: Result<Json<EnqueueRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<EnqueueResponse>), ApiError> {
    let Json(body) = body.map_err(bad_body)?;
    let job_id = state
        .gateway
        .enqueue(&body.prompt)
        .await
        .map_err(gateway_err)?;

    Ok((StatusCode::ACCEPTED, Json(EnqueueResponse { job_id })))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = state.gateway.status(id).await.map_err(gateway_err)?;
    Ok(Json(JobView::from(job)))
}

pub async fn wait_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(q): Query<WaitQuery>,
) -> Result<Response, ApiError> {
    let outcome = state
        .gateway
        .await_result(id, q.timeout_secs.map(Duration::from_secs))
        .await
        .map_err(gateway_err)?;

    Ok(outcome_response(outcome))
}

pub async fn metrics(State(state): State<ApiState>) -> Result<Json<Metrics>, ApiError> {
    let m = Metrics::collect(
        state.store.as_ref(),
        state.queue.as_ref(),
        state.providers.as_ref().clone(),
    )
    .await
    .map_err(internal_err)?;
    Ok(Json(m))
}

pub async fn metrics_prom(State(state): State<ApiState>) -> Response {
    match Metrics::collect(
        state.store.as_ref(),
        state.queue.as_ref(),
        state.providers.as_ref().clone(),
    )
    .await
    {
        Ok(m) => (StatusCode::OK, m.render_prometheus()).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics error: {e}"),
        )
            .into_response(),
    }
}

pub async fn cache_stats(State(state): State<ApiState>) -> Result<Json<CacheStats>, ApiError> {
    match &state.cache {
        Some(cache) => Ok(Json(cache.stats().await.map_err(internal_err)?)),
        None => Ok(Json(CacheStats::disabled())),
    }
}

pub async fn cache_clear(
    State(state): State<ApiState>,
) -> Result<Json<CacheClearResponse>, ApiError> {
    let cache = state.cache.as_ref().ok_or_else(cache_disabled)?;
    let cleared = cache.clear().await.map_err(internal_err)?;
    Ok(Json(CacheClearResponse { cleared }))
}

/// Prompts are sanitised the same way the gateway does before a job is
/// created, so the key matches what the dispatcher cached.
pub async fn cache_info(
    State(state): State<ApiState>,
    Query(q): Query<CacheInfoQuery>,
) -> Result<Json<CacheEntryInfo>, ApiError> {
    let cache = state.cache.as_ref().ok_or_else(cache_disabled)?;

    let prompt = sanitize_prompt(q.prompt.as_deref().unwrap_or_default());
    if prompt.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "prompt parameter required"));
    }

    let provider = match q.provider {
        Some(p) => p,
        None => state
            .provider_models
            .first()
            .map(|(name, _)| name.clone())
            .ok_or_else(|| error(StatusCode::BAD_REQUEST, "no provider configured; pass provider"))?,
    };
    let model = match q.model {
        Some(m) => m,
        None => state
            .provider_models
            .iter()
            .find(|(name, _)| *name == provider)
            .map(|(_, model)| model.clone())
            .ok_or_else(|| {
                error(
                    StatusCode::BAD_REQUEST,
                    format!("provider {provider:?} is not configured; pass model"),
                )
            })?,
    };

    let info = cache
        .info(&prompt, &provider, &model)
        .await
        .map_err(internal_err)?;
    Ok(Json(info))
}

pub async fn health(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let store = match state.store.ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "store health check failed");
            false
        }
    };
    let providers = !state.providers.is_empty();
    let ok = store && providers;

    let code = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(HealthResponse { ok, store, providers }))
}
