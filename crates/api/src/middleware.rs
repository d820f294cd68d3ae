use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use shardmap_infra::{Delivery, LockProtocol};

use crate::app::errors;

/// Parse the lock headers of a task delivery into a [`Delivery`] extension.
///
/// Deliveries without a usable lock id or sequence are rejected with 400 and
/// never reach a handler.
pub async fn task_delivery(mut req: axum::http::Request<axum::body::Body>, next: Next) -> Result<Response, Response> {
    let delivery = extract_delivery(req.headers())
        .map_err(|message| errors::json_error(StatusCode::BAD_REQUEST, "malformed_task", message))?;

    tracing::debug!(
        path = %req.uri().path(),
        id = %delivery.id,
        seq = delivery.seq,
        attempt = delivery.attempt,
        "task delivery"
    );
    req.extensions_mut().insert(delivery);
    Ok(next.run(req).await)
}

fn extract_delivery(headers: &HeaderMap) -> Result<Delivery, String> {
    LockProtocol::parse_lock(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    })
    .map_err(|e| e.to_string())
}
