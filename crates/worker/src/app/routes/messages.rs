use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::Response,
};
use serde_json::json;

use trackflow_queue::Message;

use crate::app::AdminState;
use crate::app::errors::parse_message_id;
use crate::app::routes::blocking;

pub async fn get_message(
    Extension(state): Extension<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Message>, Response> {
    let id = parse_message_id(id)?;
    let message = blocking(move || state.queue.get_message(&id)).await?;
    Ok(Json(message))
}

/// Skip the remaining retry delay of a `retrying` message.
pub async fn retry_message(
    Extension(state): Extension<AdminState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), Response> {
    let id = parse_message_id(id)?;
    let queue = state.queue.clone();
    let retried = id.clone();
    blocking(move || queue.retry_message(&retried)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "status": "pending" })),
    ))
}
