//! Admin HTTP surface over the queue.
//!
//! - `routes/`: one file per resource
//! - `errors.rs`: `QueueError` to JSON error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use trackflow_queue::{LocalQueue, QueueService};

pub mod errors;
pub mod routes;

/// What the admin handlers operate on.
#[derive(Clone)]
pub struct AdminState {
    pub queue: Arc<dyn QueueService>,
    /// Present when the local backend is running; enables `/stats`.
    pub local: Option<LocalQueue>,
}

impl AdminState {
    pub fn local(queue: LocalQueue) -> Self {
        Self {
            queue: Arc::new(queue.clone()),
            local: Some(queue),
        }
    }

    pub fn remote(queue: Arc<dyn QueueService>) -> Self {
        Self { queue, local: None }
    }
}

/// Build the admin router (used by `main.rs` and the black-box tests).
pub fn build_app(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .merge(routes::router())
        .layer(ServiceBuilder::new().layer(Extension(state)))
}
