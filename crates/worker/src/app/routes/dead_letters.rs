use axum::{
    Json,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use crate::app::AdminState;
use crate::app::errors::{parse_message_id, parse_topic};
use crate::app::routes::blocking;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 500;

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

pub async fn list(
    Extension(state): Extension<AdminState>,
    Path(topic): Path<String>,
    Query(page): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, Response> {
    let topic = parse_topic(topic)?;
    let offset = page.offset.unwrap_or(0);
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    let listed = topic.clone();
    let messages =
        blocking(move || state.queue.list_dead_letters(&listed, offset, limit)).await?;

    Ok(Json(json!({
        "topic": topic,
        "offset": offset,
        "limit": limit,
        "messages": messages,
    })))
}

pub async fn replay(
    Extension(state): Extension<AdminState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), Response> {
    let id = parse_message_id(id)?;
    let replayed = id.clone();
    blocking(move || state.queue.replay_dead_letter(&replayed)).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "status": "pending" })),
    ))
}

pub async fn purge(
    Extension(state): Extension<AdminState>,
    Path(topic): Path<String>,
) -> Result<Json<serde_json::Value>, Response> {
    let topic = parse_topic(topic)?;
    let purged_topic = topic.clone();
    let purged = blocking(move || state.queue.purge_dead_letters(&purged_topic)).await?;
    Ok(Json(json!({ "topic": topic, "purged": purged })))
}
