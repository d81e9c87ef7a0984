//! Retry scheduling and promotion of due retries.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use trackflow_core::MessageId;

use crate::context::QueueContext;
use crate::dead_letter::DeadLetterManager;
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerError;
use crate::message::{Message, MessageStatus, Topic};

/// What a Nack did with the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Parked until `due_at`, then re-enqueued.
    Retrying {
        retry_count: u32,
        due_at: DateTime<Utc>,
    },
    /// Budget exhausted or payload malformed.
    DeadLettered,
}

#[derive(Clone)]
pub struct RetryScheduler {
    ctx: Arc<QueueContext>,
    dead_letters: DeadLetterManager,
}

impl RetryScheduler {
    pub(crate) fn new(ctx: Arc<QueueContext>, dead_letters: DeadLetterManager) -> Self {
        Self { ctx, dead_letters }
    }

    /// Record a failure for `message` and park it in the delayed set or the
    /// dead-letter set. The caller holds the message lock.
    pub(crate) fn schedule(
        &self,
        message: &mut Message,
        error: &HandlerError,
    ) -> QueueResult<NackOutcome> {
        if error.is_permanent() || !message.has_retry_budget() {
            self.dead_letters.move_to_dead_letter(message, error.to_string())?;
            return Ok(NackOutcome::DeadLettered);
        }

        let now = self.ctx.clock.now();
        message.mark_retrying(error.to_string(), now);
        let delay = self.ctx.config.delay_for_retry(message.retry_count);
        let due_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500));

        // Index before the status write: a Retrying record must always be
        // reachable from the delayed set.
        self.ctx.kv.zadd(
            &self.ctx.keys.delayed(&message.topic),
            message.id.as_str(),
            due_at.timestamp_millis(),
        )?;
        self.ctx.messages.put(message)?;

        debug!(
            message_id = %message.id,
            topic = %message.topic,
            retry_count = message.retry_count,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        Ok(NackOutcome::Retrying {
            retry_count: message.retry_count,
            due_at,
        })
    }

    /// Re-enqueue up to `limit` retries of `topic` whose delay has elapsed.
    pub fn promote_due(&self, topic: &Topic, limit: usize) -> QueueResult<usize> {
        let key = self.ctx.keys.delayed(topic);
        let now_ms = self.ctx.clock.now_millis();
        let mut promoted = 0;
        for raw in self.ctx.kv.zrange_by_score(&key, now_ms, limit)? {
            let Ok(id) = MessageId::parse(raw.as_str()) else {
                self.ctx.kv.zrem(&key, &raw)?;
                continue;
            };
            if self.promote(topic, &id)? {
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// [`RetryScheduler::promote_due`] across every known topic.
    pub fn promote_all_due(&self, limit: usize) -> QueueResult<usize> {
        let mut promoted = 0;
        for raw in self.ctx.kv.smembers(&self.ctx.keys.topics())? {
            if let Ok(topic) = Topic::new(raw) {
                promoted += self.promote_due(&topic, limit)?;
            }
        }
        Ok(promoted)
    }

    /// Skip the remaining delay of a retrying message.
    pub fn retry_now(&self, id: &MessageId) -> QueueResult<()> {
        let message = self.ctx.messages.load(id)?;
        if message.status != MessageStatus::Retrying {
            return Err(QueueError::InvalidState {
                id: id.clone(),
                status: message.status,
                expected: "retrying",
            });
        }
        if !self.promote(&message.topic, id)? {
            return Err(QueueError::Busy(id.clone()));
        }
        info!(message_id = %id, topic = %message.topic, "retry forced");
        Ok(())
    }

    pub fn count(&self, topic: &Topic) -> QueueResult<usize> {
        self.ctx.kv.zcard(&self.ctx.keys.delayed(topic))
    }

    /// Move one delayed id back to its lane. Returns `false` if the id was
    /// locked by someone else or turned out to be stale.
    fn promote(&self, topic: &Topic, id: &MessageId) -> QueueResult<bool> {
        let token = QueueContext::new_token("promoter");
        if !self.ctx.try_lock(id, &token)? {
            return Ok(false);
        }
        let result = self.promote_locked(topic, id);
        self.ctx.unlock(id, &token)?;
        result
    }

    fn promote_locked(&self, topic: &Topic, id: &MessageId) -> QueueResult<bool> {
        let key = self.ctx.keys.delayed(topic);
        let mut message = match self.ctx.messages.get(id) {
            Ok(Some(message)) => message,
            Ok(None) => {
                self.ctx.kv.zrem(&key, id.as_str())?;
                return Ok(false);
            }
            Err(QueueError::Serialization(_)) => {
                self.dead_letters.park_undecodable(topic, id)?;
                self.ctx.kv.zrem(&key, id.as_str())?;
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        // Pending here means an earlier promotion stopped half-way.
        if !matches!(message.status, MessageStatus::Retrying | MessageStatus::Pending) {
            self.ctx.kv.zrem(&key, id.as_str())?;
            return Ok(false);
        }

        message.mark_pending(self.ctx.clock.now());
        self.ctx.messages.put(&message)?;
        self.ctx.router.requeue(&message)?;
        self.ctx.kv.zrem(&key, id.as_str())?;
        debug!(message_id = %id, topic = %topic, "retry promoted");
        Ok(true)
    }
}
