//! The `track_processing` topic: published after a track is stored, consumed
//! by the enrichment worker.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use trackflow_core::{MessageId, TrackId};
use trackflow_queue::{
    Handler, HandlerError, Message, Priority, PublishRequest, QueueResult, QueueService, Topic,
    handler,
};

pub const TRACK_PROCESSING_TOPIC: &str = "track_processing";

/// Payload of a `track_processing` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackJob {
    pub track_id: TrackId,
}

pub fn track_processing_topic() -> QueueResult<Topic> {
    Ok(Topic::new(TRACK_PROCESSING_TOPIC)?)
}

/// Enrichment and storage of one track. Must tolerate being called more than
/// once for the same track.
pub trait TrackEnricher: Send + Sync {
    fn enrich(&self, track_id: TrackId) -> anyhow::Result<()>;
}

/// Enricher used when no enrichment service is wired in: logs and succeeds.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEnricher;

impl TrackEnricher for LoggingEnricher {
    fn enrich(&self, track_id: TrackId) -> anyhow::Result<()> {
        info!(track_id = %track_id, "track enrichment requested");
        Ok(())
    }
}

/// Consumer for `track_processing`. Payloads that do not decode into a
/// [`TrackJob`] are dead-lettered without retries.
pub fn track_processing_handler(enricher: Arc<dyn TrackEnricher>) -> Handler {
    handler(move |message: &Message| {
        let job: TrackJob = serde_json::from_value(serde_json::Value::Object(message.payload.clone()))?;
        debug!(message_id = %message.id, track_id = %job.track_id, "enriching track");
        enricher.enrich(job.track_id).map_err(HandlerError::from)
    })
}

/// Register the enrichment consumer on `queue`.
pub fn subscribe_track_processing(
    queue: &dyn QueueService,
    enricher: Arc<dyn TrackEnricher>,
) -> QueueResult<()> {
    queue.subscribe(&track_processing_topic()?, track_processing_handler(enricher))
}

/// Producer side, called by ingestion once a track is persisted.
#[derive(Clone)]
pub struct TrackIngestion {
    queue: Arc<dyn QueueService>,
}

impl TrackIngestion {
    pub fn new(queue: Arc<dyn QueueService>) -> Self {
        Self { queue }
    }

    pub fn track_stored(&self, track_id: TrackId) -> QueueResult<MessageId> {
        let request = PublishRequest::encode(TRACK_PROCESSING_TOPIC, &TrackJob { track_id })?
            .with_priority(Priority::Medium);
        self.queue.publish(request)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use trackflow_queue::{LocalQueue, MessageStatus, QueueConfig};

    use super::*;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<TrackId>>,
        fail: bool,
    }

    impl TrackEnricher for Recording {
        fn enrich(&self, track_id: TrackId) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(track_id);
            if self.fail {
                anyhow::bail!("enrichment service unavailable");
            }
            Ok(())
        }
    }

    fn queue() -> Arc<LocalQueue> {
        Arc::new(LocalQueue::in_memory(
            QueueConfig::default().with_retry_delays(vec![std::time::Duration::ZERO]),
        ))
    }

    #[test]
    fn stored_track_is_published_at_medium_priority() {
        let queue = queue();
        let ingestion = TrackIngestion::new(queue.clone());
        let track_id = TrackId::new();

        let id = ingestion.track_stored(track_id).unwrap();
        let message = queue.get_message(&id).unwrap();

        assert_eq!(message.topic, track_processing_topic().unwrap());
        assert_eq!(message.priority, Priority::Medium);
        assert_eq!(message.status, MessageStatus::Pending);
        assert_eq!(
            message.payload.get("track_id").and_then(|v| v.as_str()),
            Some(track_id.to_string().as_str())
        );
    }

    #[test]
    fn handler_enriches_the_stored_track() {
        let queue = queue();
        let enricher = Arc::new(Recording::default());
        subscribe_track_processing(queue.as_ref(), enricher.clone()).unwrap();
        let track_id = TrackId::new();
        let id = TrackIngestion::new(queue.clone()).track_stored(track_id).unwrap();

        assert_eq!(queue.poll_once().unwrap(), 1);

        assert_eq!(*enricher.seen.lock().unwrap(), vec![track_id]);
        assert_eq!(queue.get_message(&id).unwrap().status, MessageStatus::Completed);
    }

    #[test]
    fn enrichment_failure_schedules_a_retry() {
        let queue = queue();
        let enricher = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        subscribe_track_processing(queue.as_ref(), enricher).unwrap();
        let id = TrackIngestion::new(queue.clone()).track_stored(TrackId::new()).unwrap();

        queue.poll_once().unwrap();

        let message = queue.get_message(&id).unwrap();
        assert_eq!(message.status, MessageStatus::Retrying);
        assert_eq!(message.retry_count, 1);
        assert_eq!(
            message.error_message.as_deref(),
            Some("enrichment service unavailable")
        );
    }

    #[test]
    fn undecodable_job_is_dead_lettered_immediately() {
        let queue = queue();
        let enricher = Arc::new(Recording::default());
        subscribe_track_processing(queue.as_ref(), enricher.clone()).unwrap();
        let request = PublishRequest::encode(
            TRACK_PROCESSING_TOPIC,
            &serde_json::json!({"track_id": "not-a-uuid"}),
        )
        .unwrap();
        let id = queue.publish(request).unwrap();

        queue.poll_once().unwrap();

        let message = queue.get_message(&id).unwrap();
        assert_eq!(message.status, MessageStatus::DeadLetter);
        assert_eq!(message.retry_count, 0);
        assert!(enricher.seen.lock().unwrap().is_empty());
    }
}
