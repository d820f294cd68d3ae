use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use shardmap_core::JobId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/:id", get(get_job))
        .route("/:id/abort", post(abort_job))
}

pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitJobRequest>,
) -> axum::response::Response {
    let submission = match body.into_submission() {
        Ok(s) => s,
        Err(response) => return response,
    };

    let result = tokio::task::spawn_blocking(move || services.orchestrator.jobs().submit(submission)).await;
    match result {
        Ok(Ok(job)) => (StatusCode::CREATED, Json(dto::JobStatusResponse::from(&job))).into_response(),
        Ok(Err(e)) => errors::handler_error_to_response(e),
        Err(join) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "handler_panicked", join.to_string()),
    }
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match JobId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    let result = tokio::task::spawn_blocking(move || services.orchestrator.jobs().status(&id)).await;
    match result {
        Ok(Ok(job)) => (StatusCode::OK, Json(dto::JobStatusResponse::from(&job))).into_response(),
        Ok(Err(e)) => errors::handler_error_to_response(e),
        Err(join) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "handler_panicked", join.to_string()),
    }
}

pub async fn abort_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match JobId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    let result = tokio::task::spawn_blocking(move || services.orchestrator.jobs().abort(&id)).await;
    match result {
        Ok(Ok(job)) => (StatusCode::ACCEPTED, Json(dto::JobStatusResponse::from(&job))).into_response(),
        Ok(Err(e)) => errors::handler_error_to_response(e),
        Err(join) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "handler_panicked", join.to_string()),
    }
}
