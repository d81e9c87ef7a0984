use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use trackflow_core::MessageId;
use trackflow_queue::{QueueError, Topic};

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    let message = err.to_string();
    match err {
        QueueError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", message),
        QueueError::Unsupported { .. } => {
            json_error(StatusCode::NOT_IMPLEMENTED, "unsupported", message)
        }
        QueueError::Validation(_) => json_error(StatusCode::BAD_REQUEST, "validation_error", message),
        QueueError::InvalidState { .. } => json_error(StatusCode::CONFLICT, "invalid_state", message),
        QueueError::Busy(_) => json_error(StatusCode::CONFLICT, "busy", message),
        QueueError::AlreadyExists(_) => json_error(StatusCode::CONFLICT, "already_exists", message),
        QueueError::LeaseLost(_) => json_error(StatusCode::CONFLICT, "lease_lost", message),
        QueueError::Transport(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "transport_error", message)
        }
        QueueError::Serialization(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "serialization_error", message)
        }
    }
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

pub fn parse_message_id(raw: String) -> Result<MessageId, axum::response::Response> {
    MessageId::parse(raw)
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_message_id", e.to_string()))
}

pub fn parse_topic(raw: String) -> Result<Topic, axum::response::Response> {
    Topic::new(raw).map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_topic", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_queue_errors_to_statuses() {
        let id = MessageId::parse("m-1").unwrap();
        let cases = [
            (QueueError::NotFound(id.clone()), StatusCode::NOT_FOUND),
            (
                QueueError::unsupported("redis-streams", "retry_message"),
                StatusCode::NOT_IMPLEMENTED,
            ),
            (QueueError::Busy(id.clone()), StatusCode::CONFLICT),
            (QueueError::transport("down"), StatusCode::SERVICE_UNAVAILABLE),
            (QueueError::Validation("bad".into()), StatusCode::BAD_REQUEST),
        ];
        for (err, status) in cases {
            assert_eq!(queue_error_to_response(err).status(), status);
        }
    }

    #[test]
    fn rejects_ids_with_whitespace() {
        let response = parse_message_id("a b".to_string()).unwrap_err();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
