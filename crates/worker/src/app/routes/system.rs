use axum::{
    Json,
    extract::{Extension, Path},
    response::Response,
};
use serde_json::json;

use trackflow_queue::QueueError;

use crate::app::AdminState;
use crate::app::errors::{parse_topic, queue_error_to_response};
use crate::app::routes::blocking;

pub async fn health(Extension(state): Extension<AdminState>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "backend": state.queue.backend() }))
}

/// Lane depths and delivery counters. Local backend only.
pub async fn stats(
    Extension(state): Extension<AdminState>,
    Path(topic): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let topic = parse_topic(topic)?;
    let Some(local) = state.local else {
        return Err(queue_error_to_response(QueueError::unsupported(
            state.queue.backend(),
            "stats",
        )));
    };

    let (topic_stats, runtime) = blocking(move || {
        let topic_stats = local.stats(&topic)?;
        Ok((topic_stats, local.runtime_stats()))
    })
    .await?;

    Ok(Json(json!({ "topic": topic_stats, "runtime": runtime })))
}
