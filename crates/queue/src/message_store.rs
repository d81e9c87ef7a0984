//! Message records on top of the key-value store.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use trackflow_core::MessageId;

use crate::error::{QueueError, QueueResult};
use crate::message::{Message, MessageStatus};
use crate::store::{Keys, KvStore};

/// Durable record of each message and its lifecycle state, keyed by id.
#[derive(Clone)]
pub struct MessageStore {
    kv: Arc<dyn KvStore>,
    keys: Keys,
    completed_ttl: Duration,
    dead_letter_ttl: Duration,
}

impl MessageStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        keys: Keys,
        completed_ttl: Duration,
        dead_letter_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            keys,
            completed_ttl,
            dead_letter_ttl,
        }
    }

    /// Retention for a record in `status`: active records never expire.
    fn ttl_for(&self, status: MessageStatus) -> Option<Duration> {
        match status {
            MessageStatus::Completed => Some(self.completed_ttl),
            MessageStatus::DeadLetter => Some(self.dead_letter_ttl),
            _ => None,
        }
    }

    /// Write (or overwrite) a record.
    pub fn put(&self, message: &Message) -> QueueResult<()> {
        let json = serde_json::to_string(message)?;
        self.kv.set(
            &self.keys.message(&message.id),
            &json,
            self.ttl_for(message.status),
        )
    }

    /// Write a brand-new record; fails if the id is already taken.
    pub fn insert(&self, message: &Message) -> QueueResult<()> {
        let json = serde_json::to_string(message)?;
        let created = self.kv.set_nx(
            &self.keys.message(&message.id),
            &json,
            self.ttl_for(message.status),
        )?;
        if !created {
            return Err(QueueError::AlreadyExists(message.id.clone()));
        }
        Ok(())
    }

    /// Read a record. A record that no longer decodes is reported as a
    /// serialization error, never silently dropped.
    pub fn get(&self, id: &MessageId) -> QueueResult<Option<Message>> {
        let Some(raw) = self.kv.get(&self.keys.message(id))? else {
            return Ok(None);
        };
        serde_json::from_str(&raw).map(Some).map_err(|e| {
            warn!(message_id = %id, error = %e, "stored message record does not decode");
            QueueError::serialization(format!("message {id}: {e}"))
        })
    }

    /// Like [`MessageStore::get`] but unknown ids are `NotFound`.
    pub fn load(&self, id: &MessageId) -> QueueResult<Message> {
        self.get(id)?.ok_or_else(|| QueueError::NotFound(id.clone()))
    }

    pub fn delete(&self, id: &MessageId) -> QueueResult<bool> {
        self.kv.del(&self.keys.message(id))
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use trackflow_core::{Clock, ManualClock};

    use super::*;
    use crate::message::{Priority, Topic, payload_from};
    use crate::store::InMemoryKvStore;

    fn fixture() -> (Arc<ManualClock>, Arc<InMemoryKvStore>, MessageStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let kv = Arc::new(InMemoryKvStore::with_clock(clock.clone()));
        let store = MessageStore::new(
            kv.clone(),
            Keys::new("t"),
            Duration::from_secs(60),
            Duration::from_secs(600),
        );
        (clock, kv, store)
    }

    fn message(id: &str) -> Message {
        Message::new(
            MessageId::parse(id).unwrap(),
            Topic::new("batch").unwrap(),
            payload_from(&json!({"n": 1})).unwrap(),
            Priority::Low,
            3,
            Utc::now(),
        )
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let (_, _, store) = fixture();
        let msg = message("dup");
        store.insert(&msg).unwrap();
        assert!(matches!(store.insert(&msg), Err(QueueError::AlreadyExists(_))));
    }

    #[test]
    fn concurrent_inserts_of_one_id_have_a_single_winner() {
        let (_, _, store) = fixture();
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|n| {
                    let store = &store;
                    scope.spawn(move || {
                        let mut msg = message("racy");
                        msg.retry_count = n;
                        store.insert(&msg).is_ok() as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn insert_does_not_overwrite_an_existing_record() {
        let (_, _, store) = fixture();
        let mut first = message("taken");
        first.max_retries = 7;
        store.put(&first).unwrap();

        assert!(matches!(
            store.insert(&message("taken")),
            Err(QueueError::AlreadyExists(_))
        ));
        assert_eq!(store.load(&first.id).unwrap().max_retries, 7);
    }

    #[test]
    fn completed_records_expire_after_retention() {
        let (clock, _, store) = fixture();
        let mut msg = message("done");
        store.insert(&msg).unwrap();

        msg.mark_completed(clock.now());
        store.put(&msg).unwrap();
        assert!(store.get(&msg.id).unwrap().is_some());

        clock.advance(Duration::from_secs(61));
        assert!(store.get(&msg.id).unwrap().is_none());
        assert!(matches!(store.load(&msg.id), Err(QueueError::NotFound(_))));
    }

    #[test]
    fn pending_records_do_not_expire() {
        let (clock, _, store) = fixture();
        let msg = message("live");
        store.insert(&msg).unwrap();
        clock.advance(Duration::from_secs(10_000));
        assert!(store.get(&msg.id).unwrap().is_some());
    }

    #[test]
    fn corrupt_record_is_a_serialization_error() {
        let (_, kv, store) = fixture();
        let id = MessageId::parse("bad").unwrap();
        kv.set("t:msg:bad", "{not json", None).unwrap();
        assert!(matches!(store.get(&id), Err(QueueError::Serialization(_))));
    }
}
