//! Dead-letter set: messages whose retry budget ran out (or whose payload
//! was malformed), kept per topic for inspection, replay or purge.

use std::sync::Arc;

use tracing::{info, warn};

use trackflow_core::MessageId;

use crate::context::QueueContext;
use crate::error::{QueueError, QueueResult};
use crate::message::{Message, MessageStatus, Topic};

#[derive(Clone)]
pub struct DeadLetterManager {
    ctx: Arc<QueueContext>,
}

impl DeadLetterManager {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        Self { ctx }
    }

    /// Mark `message` dead-lettered and index it under its topic.
    ///
    /// The caller holds the message lock and clears in-flight state.
    pub(crate) fn move_to_dead_letter(&self, message: &mut Message, reason: String) -> QueueResult<()> {
        message.mark_dead_letter(reason, self.ctx.clock.now());
        self.index(message)?;
        self.ctx.messages.put(message)?;
        warn!(
            message_id = %message.id,
            topic = %message.topic,
            retry_count = message.retry_count,
            reason = message.error_message.as_deref().unwrap_or_default(),
            "message dead-lettered"
        );
        Ok(())
    }

    /// Add `message` to its topic's dead-letter set, scored by creation time.
    pub(crate) fn index(&self, message: &Message) -> QueueResult<()> {
        self.ctx.kv.zadd(
            &self.ctx.keys.dead_letters(&message.topic),
            message.id.as_str(),
            message.created_at.timestamp_millis(),
        )
    }

    /// Index an id whose record no longer decodes. Listing skips it; purge
    /// removes it.
    pub(crate) fn park_undecodable(&self, topic: &Topic, id: &MessageId) -> QueueResult<()> {
        self.ctx.kv.zadd(
            &self.ctx.keys.dead_letters(topic),
            id.as_str(),
            self.ctx.clock.now_millis(),
        )?;
        warn!(message_id = %id, topic = %topic, "undecodable record dead-lettered");
        Ok(())
    }

    /// Dead letters for `topic`, oldest first, starting at `offset`.
    ///
    /// Entries whose record has expired are pruned on the way.
    pub fn list(&self, topic: &Topic, offset: usize, limit: usize) -> QueueResult<Vec<Message>> {
        let key = self.ctx.keys.dead_letters(topic);
        let mut out = Vec::new();
        for raw in self.ctx.kv.zrange(&key, offset, limit)? {
            let Ok(id) = MessageId::parse(raw.as_str()) else {
                self.ctx.kv.zrem(&key, &raw)?;
                continue;
            };
            match self.ctx.messages.get(&id) {
                Ok(Some(message)) if message.status == MessageStatus::DeadLetter => out.push(message),
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.ctx.kv.zrem(&key, id.as_str())?;
                }
                Err(QueueError::Serialization(_)) => {
                    warn!(message_id = %id, topic = %topic, "skipping undecodable dead letter");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }

    pub fn count(&self, topic: &Topic) -> QueueResult<usize> {
        self.ctx.kv.zcard(&self.ctx.keys.dead_letters(topic))
    }

    /// Move a dead letter back to its lane with a fresh retry budget.
    pub fn replay(&self, id: &MessageId) -> QueueResult<()> {
        let message = self.ctx.messages.load(id)?;
        let key = self.ctx.keys.dead_letters(&message.topic);
        if self.ctx.kv.zscore(&key, id.as_str())?.is_none() {
            return Err(QueueError::NotFound(id.clone()));
        }

        let token = QueueContext::new_token("replay");
        if !self.ctx.try_lock(id, &token)? {
            return Err(QueueError::Busy(id.clone()));
        }
        let result = self.replay_locked(id, &key);
        self.ctx.unlock(id, &token)?;
        result
    }

    fn replay_locked(&self, id: &MessageId, key: &str) -> QueueResult<()> {
        let Some(mut message) = self.ctx.messages.get(id)? else {
            self.ctx.kv.zrem(key, id.as_str())?;
            return Err(QueueError::NotFound(id.clone()));
        };
        if self.ctx.kv.zscore(key, id.as_str())?.is_none() {
            return Err(QueueError::NotFound(id.clone()));
        }
        if message.status == MessageStatus::Processing {
            return Err(QueueError::Busy(id.clone()));
        }

        message.reset_for_replay(self.ctx.clock.now());
        self.ctx.messages.put(&message)?;
        self.ctx.router.requeue(&message)?;
        self.ctx.kv.zrem(key, id.as_str())?;

        info!(message_id = %id, topic = %message.topic, "dead letter replayed");
        Ok(())
    }

    /// Delete every dead letter of `topic`; returns how many were removed.
    ///
    /// Entries locked by a concurrent replay are left alone.
    pub fn purge(&self, topic: &Topic) -> QueueResult<usize> {
        let key = self.ctx.keys.dead_letters(topic);
        let total = self.ctx.kv.zcard(&key)?;
        let mut purged = 0;

        for raw in self.ctx.kv.zrange(&key, 0, total)? {
            let Ok(id) = MessageId::parse(raw.as_str()) else {
                if self.ctx.kv.zrem(&key, &raw)? {
                    purged += 1;
                }
                continue;
            };
            let token = QueueContext::new_token("purge");
            if !self.ctx.try_lock(&id, &token)? {
                warn!(message_id = %id, topic = %topic, "dead letter busy; not purged");
                continue;
            }
            let removed = self
                .ctx
                .messages
                .delete(&id)
                .and_then(|_| self.ctx.kv.zrem(&key, id.as_str()));
            self.ctx.unlock(&id, &token)?;
            if removed? {
                purged += 1;
            }
        }

        info!(topic = %topic, purged, "dead letters purged");
        Ok(purged)
    }
}
