use axum::http::StatusCode;
use axum::response::Response;
use axum::{
    Router,
    routing::{get, post},
};

use trackflow_queue::QueueResult;

use crate::app::errors::{json_error, queue_error_to_response};

pub mod dead_letters;
pub mod messages;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/messages/:id", get(messages::get_message))
        .route("/messages/:id/retry", post(messages::retry_message))
        .route(
            "/dead-letters/:topic",
            get(dead_letters::list).delete(dead_letters::purge),
        )
        .route("/dead-letters/replay/:id", post(dead_letters::replay))
        .route("/stats/:topic", get(system::stats))
}

/// Run a queue call off the async executor; store calls block.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    F: FnOnce() -> QueueResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result.map_err(queue_error_to_response),
        Err(e) => Err(json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            format!("queue call failed: {e}"),
        )),
    }
}
