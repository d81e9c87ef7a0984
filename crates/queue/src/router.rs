//! Priority lanes.
//!
//! Each topic owns three lanes (High, Medium, Low). Candidates are always
//! drawn High first; Low is only consulted once the higher lanes are empty or
//! fully contended. A perpetually full High lane therefore starves Low.

use std::sync::Arc;

use trackflow_core::MessageId;

use crate::error::QueueResult;
use crate::message::{Message, Priority, Topic};
use crate::store::{Keys, KvStore};

/// A lane entry that a worker may try to claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: MessageId,
    pub priority: Priority,
}

/// Pending ids per priority lane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct LaneDepths {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl LaneDepths {
    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

#[derive(Clone)]
pub struct PriorityRouter {
    kv: Arc<dyn KvStore>,
    keys: Keys,
}

impl PriorityRouter {
    pub fn new(kv: Arc<dyn KvStore>, keys: Keys) -> Self {
        Self { kv, keys }
    }

    pub fn lane(&self, topic: &Topic, priority: Priority) -> String {
        self.keys.lane(topic, priority)
    }

    /// Append `message` to the tail of its lane.
    pub fn enqueue(&self, message: &Message) -> QueueResult<()> {
        self.kv
            .rpush(&self.lane(&message.topic, message.priority), message.id.as_str())
    }

    /// Put `message` back into its lane exactly once, dropping any stale copy.
    pub fn requeue(&self, message: &Message) -> QueueResult<()> {
        let lane = self.lane(&message.topic, message.priority);
        self.kv.lrem(&lane, message.id.as_str(), 0)?;
        self.kv.rpush(&lane, message.id.as_str())
    }

    /// Remove every copy of `id` from a lane; the count tells the caller
    /// whether it won the claim.
    pub fn take(&self, topic: &Topic, priority: Priority, id: &MessageId) -> QueueResult<usize> {
        self.kv.lrem(&self.lane(topic, priority), id.as_str(), 0)
    }

    /// Up to `limit` candidates in strict priority order.
    pub fn candidates(&self, topic: &Topic, limit: usize) -> QueueResult<Vec<Candidate>> {
        let mut out = Vec::with_capacity(limit);
        for priority in Priority::ALL {
            let remaining = limit - out.len();
            if remaining == 0 {
                break;
            }
            for raw in self.kv.lrange(&self.lane(topic, priority), remaining)? {
                // Ids were validated on publish; skip anything foreign.
                if let Ok(id) = MessageId::parse(raw) {
                    out.push(Candidate { id, priority });
                }
            }
        }
        Ok(out)
    }

    pub fn depths(&self, topic: &Topic) -> QueueResult<LaneDepths> {
        Ok(LaneDepths {
            high: self.kv.llen(&self.lane(topic, Priority::High))?,
            medium: self.kv.llen(&self.lane(topic, Priority::Medium))?,
            low: self.kv.llen(&self.lane(topic, Priority::Low))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store::InMemoryKvStore;

    fn message(id: &str, priority: Priority) -> Message {
        Message::new(
            MessageId::parse(id).unwrap(),
            Topic::new("t").unwrap(),
            Default::default(),
            priority,
            3,
            Utc::now(),
        )
    }

    fn router() -> PriorityRouter {
        PriorityRouter::new(Arc::new(InMemoryKvStore::new()), Keys::new("r"))
    }

    #[test]
    fn candidates_follow_strict_priority() {
        let router = router();
        router.enqueue(&message("low-1", Priority::Low)).unwrap();
        router.enqueue(&message("med-1", Priority::Medium)).unwrap();
        router.enqueue(&message("high-1", Priority::High)).unwrap();
        router.enqueue(&message("high-2", Priority::High)).unwrap();

        let topic = Topic::new("t").unwrap();
        let ids: Vec<String> = router
            .candidates(&topic, 10)
            .unwrap()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["high-1", "high-2", "med-1", "low-1"]);

        let first_two = router.candidates(&topic, 2).unwrap();
        assert!(first_two.iter().all(|c| c.priority == Priority::High));
    }

    #[test]
    fn requeue_never_duplicates() {
        let router = router();
        let msg = message("m", Priority::Medium);
        router.enqueue(&msg).unwrap();
        router.requeue(&msg).unwrap();
        router.requeue(&msg).unwrap();

        let depths = router.depths(&msg.topic).unwrap();
        assert_eq!(depths.medium, 1);
        assert_eq!(depths.total(), 1);
    }

    #[test]
    fn take_reports_whether_the_id_was_present() {
        let router = router();
        let msg = message("m", Priority::High);
        router.enqueue(&msg).unwrap();

        assert_eq!(router.take(&msg.topic, Priority::High, &msg.id).unwrap(), 1);
        assert_eq!(router.take(&msg.topic, Priority::High, &msg.id).unwrap(), 0);
    }
}
