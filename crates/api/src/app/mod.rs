//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, queue and orchestrator wiring
//! - `routes/`: task delivery endpoints and the job control surface
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

use services::AppServices;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let tasks = routes::tasks::router(&services.orchestrator)
        .route_layer(axum::middleware::from_fn(crate::middleware::task_delivery));

    Router::new()
        .route("/health", get(routes::system::health))
        .route("/queue", get(routes::system::queue_depth))
        .nest("/jobs", routes::jobs::router())
        .merge(tasks)
        .layer(Extension(services))
        .layer(ServiceBuilder::new())
}
