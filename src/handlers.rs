use std::time::Instant;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{
        header::{HeaderName, CONTENT_TYPE},
        HeaderValue,
    },
    response::{IntoResponse, Response},
    Json,
};
use tracing::info;

use crate::{
    errors::AppError,
    models::{AssistApiRequest, AssistApiResponse},
    state::AppState,
};

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.render() {
        Ok(body) => (
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(error) => AppError::Internal(format!("metrics render failed: {error}")).into_response(),
    }
}

pub async fn backends(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let statuses = state.orchestrator.backend_statuses();
    let response = Json(statuses).into_response();
    state.metrics.observe_request(
        "/v1/backends",
        "GET",
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

pub async fn assist(
    State(state): State<AppState>,
    payload: Result<Json<AssistApiRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let _inflight = state.metrics.inflight_guard();

    let response = match process_assist(&state, payload).await {
        Ok(response) => response,
        Err(error) => error.into_response(),
    };

    state.metrics.observe_request(
        "/v1/assist",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );

    response
}

async fn process_assist(
    state: &AppState,
    payload: Result<Json<AssistApiRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(payload) = payload.map_err(|rejection| AppError::BadRequest(rejection.body_text()))?;
    let request = payload.into_request().map_err(AppError::BadRequest)?;

    info!(
        request_id = %request.request_id(),
        tags = request.context_tags().len(),
        max_latency_ms = request.max_latency_hint().map(|hint| hint.as_millis() as u64),
        "assist request accepted"
    );

    let report = state.orchestrator.answer_with_report(&request).await;
    let cache_status = if report.cached { "hit" } else { "miss" };
    info!(
        request_id = %report.request_id,
        backend = %report.answer.backend_id,
        quality = report.answer.quality_score,
        attempts = report.attempts.len(),
        degraded = report.degraded(),
        cache = cache_status,
        "assist request answered"
    );

    let mut response = Json(AssistApiResponse::from_report(report)).into_response();
    response.headers_mut().insert(
        HeaderName::from_static("x-cache"),
        HeaderValue::from_static(cache_status),
    );
    Ok(response)
}
