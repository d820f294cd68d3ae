//! Task delivery endpoints: one POST route per orchestration step.
//!
//! The response status is the delivery verdict: 2xx acknowledges the task,
//! 409 and other 4xx drop it, 5xx asks the substrate to redeliver.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use shardmap_infra::{Delivery, Orchestrator, Route};

use crate::app::errors;
use crate::app::services::AppServices;

pub fn router(orchestrator: &Orchestrator) -> Router {
    orchestrator
        .routes()
        .into_iter()
        .fold(Router::new(), |router, (path, route)| {
            router.route(
                &path,
                post(move |services: Extension<Arc<AppServices>>, delivery: Extension<Delivery>| {
                    deliver(services, delivery, route)
                }),
            )
        })
}

async fn deliver(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(delivery): Extension<Delivery>,
    route: Route,
) -> axum::response::Response {
    let id = delivery.id.clone();
    // Handlers block on the store; keep them off the async workers.
    let result = tokio::task::spawn_blocking(move || services.orchestrator.dispatch(route, &delivery)).await;

    match result {
        Ok(Ok(outcome)) => (StatusCode::OK, Json(serde_json::json!({ "id": id, "outcome": outcome }))).into_response(),
        Ok(Err(e)) => {
            if e.should_retry() {
                tracing::warn!(%id, ?route, error = %e, "task failed, requesting redelivery");
            }
            errors::handler_error_to_response(e)
        }
        Err(join) => errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "handler_panicked", join.to_string()),
    }
}
