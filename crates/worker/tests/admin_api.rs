use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

use trackflow_core::{MessageId, TrackId};
use trackflow_queue::{
    Handler, HandlerError, LocalQueue, Message, PublishRequest, QueueConfig, QueueError,
    QueueResult, QueueService, Topic, handler,
};
use trackflow_worker::app::{AdminState, build_app};
use trackflow_worker::tracks::{TRACK_PROCESSING_TOPIC, TrackIngestion};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(state: AdminState) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = build_app(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn local_queue() -> LocalQueue {
    LocalQueue::in_memory(
        QueueConfig::default()
            .with_retry_delays(vec![Duration::ZERO])
            .with_max_retries(0),
    )
}

fn topic() -> Topic {
    Topic::new(TRACK_PROCESSING_TOPIC).unwrap()
}

/// Publish one track job and fail it straight into the dead-letter set.
fn dead_letter_one(queue: &LocalQueue) -> MessageId {
    queue
        .subscribe(&topic(), handler(|_| Err(HandlerError::failed("enrichment down"))))
        .unwrap();
    let id = TrackIngestion::new(Arc::new(queue.clone()))
        .track_stored(TrackId::new())
        .unwrap();
    assert_eq!(queue.poll_once().unwrap(), 1);
    id
}

#[tokio::test]
async fn health_reports_backend() {
    let server = TestServer::spawn(AdminState::local(local_queue())).await;

    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "local");
}

#[tokio::test]
async fn message_lookup_returns_wire_shape_or_404() {
    let queue = local_queue();
    let track_id = TrackId::new();
    let id = TrackIngestion::new(Arc::new(queue.clone()))
        .track_stored(track_id)
        .unwrap();
    let server = TestServer::spawn(AdminState::local(queue)).await;

    let res = reqwest::get(format!("{}/messages/{}", server.base_url, id))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["type"], TRACK_PROCESSING_TOPIC);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["priority"], "medium");
    assert_eq!(body["retry_count"], 0);
    assert_eq!(body["data"]["track_id"], track_id.to_string());

    let res = reqwest::get(format!("{}/messages/unknown-id", server.base_url))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn dead_letters_can_be_listed_replayed_and_purged() {
    let queue = local_queue();
    let first = dead_letter_one(&queue);
    let server = TestServer::spawn(AdminState::local(queue.clone())).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!(
            "{}/dead-letters/{}?offset=0&limit=10",
            server.base_url, TRACK_PROCESSING_TOPIC
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    let listed = body["messages"].as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], first.as_str());
    assert_eq!(listed[0]["status"], "dead_letter");
    assert_eq!(listed[0]["error_message"], "enrichment down");

    let res = client
        .post(format!("{}/dead-letters/replay/{}", server.base_url, first))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let replayed = queue.get_message(&first).unwrap();
    assert_eq!(replayed.retry_count, 0);
    assert!(replayed.error_message.is_none());

    // Replaying a message that is no longer dead-lettered is a 404.
    let res = client
        .post(format!("{}/dead-letters/replay/{}", server.base_url, first))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    queue.poll_once().unwrap();
    let res = client
        .delete(format!("{}/dead-letters/{}", server.base_url, TRACK_PROCESSING_TOPIC))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["purged"], 1);
    assert!(matches!(queue.get_message(&first), Err(QueueError::NotFound(_))));
}

#[tokio::test]
async fn retry_requires_a_retrying_message() {
    let queue = local_queue();
    let id = TrackIngestion::new(Arc::new(queue.clone()))
        .track_stored(TrackId::new())
        .unwrap();
    let server = TestServer::spawn(AdminState::local(queue)).await;

    let res = reqwest::Client::new()
        .post(format!("{}/messages/{}/retry", server.base_url, id))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_state");
}

#[tokio::test]
async fn stats_report_lane_depths() {
    let queue = local_queue();
    let ingestion = TrackIngestion::new(Arc::new(queue.clone()));
    ingestion.track_stored(TrackId::new()).unwrap();
    ingestion.track_stored(TrackId::new()).unwrap();
    let server = TestServer::spawn(AdminState::local(queue)).await;

    let res = reqwest::get(format!("{}/stats/{}", server.base_url, TRACK_PROCESSING_TOPIC))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["topic"]["lanes"]["medium"], 2);
    assert_eq!(body["topic"]["lanes"]["high"], 0);
    assert_eq!(body["topic"]["dead_letters"], 0);
}

#[tokio::test]
async fn invalid_path_segments_are_rejected() {
    let server = TestServer::spawn(AdminState::local(local_queue())).await;

    let res = reqwest::get(format!("{}/dead-letters/{}", server.base_url, "bad%20topic"))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_topic");
}

/// Backend with only publish/subscribe, like the streams consumer groups.
struct PublishOnly;

impl QueueService for PublishOnly {
    fn backend(&self) -> &'static str {
        "publish-only"
    }

    fn publish(&self, _request: PublishRequest) -> QueueResult<MessageId> {
        Ok(MessageId::generate())
    }

    fn subscribe(&self, _topic: &Topic, _handler: Handler) -> QueueResult<()> {
        Ok(())
    }

    fn ack_message(&self, _id: &MessageId) -> QueueResult<()> {
        Err(QueueError::unsupported("publish-only", "ack_message"))
    }

    fn nack_message(&self, _id: &MessageId, _error: &str) -> QueueResult<()> {
        Err(QueueError::unsupported("publish-only", "nack_message"))
    }

    fn retry_message(&self, _id: &MessageId) -> QueueResult<()> {
        Err(QueueError::unsupported("publish-only", "retry_message"))
    }

    fn get_message(&self, _id: &MessageId) -> QueueResult<Message> {
        Err(QueueError::unsupported("publish-only", "get_message"))
    }

    fn list_dead_letters(&self, _topic: &Topic, _offset: usize, _limit: usize) -> QueueResult<Vec<Message>> {
        Err(QueueError::unsupported("publish-only", "list_dead_letters"))
    }

    fn replay_dead_letter(&self, _id: &MessageId) -> QueueResult<()> {
        Err(QueueError::unsupported("publish-only", "replay_dead_letter"))
    }

    fn purge_dead_letters(&self, _topic: &Topic) -> QueueResult<usize> {
        Err(QueueError::unsupported("publish-only", "purge_dead_letters"))
    }
}

#[tokio::test]
async fn unsupported_operations_map_to_501() {
    let server = TestServer::spawn(AdminState::remote(Arc::new(PublishOnly))).await;
    let client = reqwest::Client::new();

    for res in [
        client.get(format!("{}/messages/m-1", server.base_url)).send().await.unwrap(),
        client
            .post(format!("{}/messages/m-1/retry", server.base_url))
            .send()
            .await
            .unwrap(),
        client
            .get(format!("{}/dead-letters/{}", server.base_url, TRACK_PROCESSING_TOPIC))
            .send()
            .await
            .unwrap(),
        client
            .get(format!("{}/stats/{}", server.base_url, TRACK_PROCESSING_TOPIC))
            .send()
            .await
            .unwrap(),
    ] {
        assert_eq!(res.status(), StatusCode::NOT_IMPLEMENTED);
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["error"], "unsupported");
    }
}
