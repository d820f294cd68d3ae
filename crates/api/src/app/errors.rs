use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use shardmap_infra::HandlerError;

pub fn handler_error_to_response(err: HandlerError) -> axum::response::Response {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let code = match &err {
        HandlerError::Lock(_) => "lock",
        HandlerError::Store(_) => "store_error",
        HandlerError::Domain(_) if status.is_server_error() => "invariant_violation",
        HandlerError::Domain(_) => "validation_error",
        HandlerError::Source(_) => "source_error",
        HandlerError::Split(_) => "split_error",
        HandlerError::Process(_) => "process_error",
        HandlerError::NotFound(_) => "not_found",
        HandlerError::AlreadyExists(_) => "conflict",
    };
    json_error(status, code, err.to_string())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmap_infra::LockError;

    #[test]
    fn lock_errors_keep_their_delivery_status() {
        let stale = LockError::Stale {
            key: "k".into(),
            seq: 1,
            current: 3,
        };
        assert_eq!(handler_error_to_response(stale.into()).status(), StatusCode::OK);

        let busy = LockError::InProgress { key: "k".into(), seq: 1 };
        assert_eq!(
            handler_error_to_response(busy.into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            handler_error_to_response(HandlerError::NotFound("job x".into())).status(),
            StatusCode::NOT_FOUND
        );
    }
}
