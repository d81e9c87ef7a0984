//! Recovery of messages whose worker died or stalled.
//!
//! An in-flight id whose lock key has expired belongs to nobody. The sweeper
//! takes the lock itself before touching the message, so a second sweeper,
//! or a promoter, never acts on the same id at the same time.

use std::sync::Arc;

use tracing::{debug, info, warn};

use trackflow_core::MessageId;

use crate::context::QueueContext;
use crate::error::{QueueError, QueueResult};
use crate::handler::HandlerError;
use crate::dead_letter::DeadLetterManager;
use crate::message::{Message, MessageStatus};
use crate::retry::RetryScheduler;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    /// Abandoned messages put back in their lane, rescheduled, or
    /// re-indexed in the delayed or dead-letter set.
    pub reclaimed: usize,
    /// In-flight entries dropped because the message was already settled.
    pub dropped: usize,
    /// Retries whose delay elapsed and were re-enqueued.
    pub promoted: usize,
}

#[derive(Clone)]
pub struct CleanupSweeper {
    ctx: Arc<QueueContext>,
    retry: RetryScheduler,
    dead_letters: DeadLetterManager,
}

enum Reclaim {
    Alive,
    Requeued,
    Dropped,
}

impl CleanupSweeper {
    pub(crate) fn new(
        ctx: Arc<QueueContext>,
        retry: RetryScheduler,
        dead_letters: DeadLetterManager,
    ) -> Self {
        Self {
            ctx,
            retry,
            dead_letters,
        }
    }

    pub fn sweep_once(&self) -> QueueResult<SweepReport> {
        let mut report = SweepReport {
            promoted: self.retry.promote_all_due(usize::MAX)?,
            ..SweepReport::default()
        };

        for raw in self.ctx.kv.smembers(&self.ctx.keys.in_flight())? {
            let Ok(id) = MessageId::parse(raw.as_str()) else {
                self.ctx.kv.srem(&self.ctx.keys.in_flight(), &raw)?;
                report.dropped += 1;
                continue;
            };
            match self.reclaim(&id)? {
                Reclaim::Alive => {}
                Reclaim::Requeued => report.reclaimed += 1,
                Reclaim::Dropped => report.dropped += 1,
            }
        }

        if report.reclaimed > 0 || report.dropped > 0 {
            info!(
                reclaimed = report.reclaimed,
                dropped = report.dropped,
                promoted = report.promoted,
                "sweep finished"
            );
        }
        Ok(report)
    }

    fn reclaim(&self, id: &MessageId) -> QueueResult<Reclaim> {
        let token = QueueContext::new_token("sweeper");
        if !self.ctx.try_lock(id, &token)? {
            return Ok(Reclaim::Alive);
        }
        let result = self.reclaim_locked(id);
        self.ctx.unlock(id, &token)?;
        result
    }

    fn reclaim_locked(&self, id: &MessageId) -> QueueResult<Reclaim> {
        let in_flight = self.ctx.keys.in_flight();
        let mut message = match self.ctx.messages.get(id) {
            Ok(Some(message)) => message,
            Ok(None) | Err(QueueError::Serialization(_)) => {
                self.ctx.kv.srem(&in_flight, id.as_str())?;
                return Ok(Reclaim::Dropped);
            }
            Err(err) => return Err(err),
        };

        match message.status {
            MessageStatus::Processing | MessageStatus::Pending => {
                // A settlement that stopped half-way may have indexed the id
                // without updating the record.
                self.ctx.kv.zrem(&self.ctx.keys.delayed(&message.topic), id.as_str())?;
                self.ctx.kv.zrem(&self.ctx.keys.dead_letters(&message.topic), id.as_str())?;

                if message.status == MessageStatus::Processing && self.ctx.config.reclaim_consumes_retry {
                    let err = HandlerError::failed("processing timeout exceeded");
                    self.retry.schedule(&mut message, &err)?;
                } else {
                    // Pending: the claim stopped between marking in-flight
                    // and taking the lane entry.
                    message.mark_pending(self.ctx.clock.now());
                    self.ctx.messages.put(&message)?;
                    self.ctx.router.requeue(&message)?;
                }
            }
            MessageStatus::Retrying | MessageStatus::DeadLetter => {
                if !self.ensure_parked(&message)? {
                    debug!(message_id = %id, status = ?message.status, "in-flight entry already settled");
                    self.ctx.kv.srem(&in_flight, id.as_str())?;
                    return Ok(Reclaim::Dropped);
                }
            }
            status => {
                debug!(message_id = %id, status = ?status, "in-flight entry already settled");
                self.ctx.kv.srem(&in_flight, id.as_str())?;
                return Ok(Reclaim::Dropped);
            }
        }

        self.ctx.kv.srem(&in_flight, id.as_str())?;
        warn!(
            message_id = %id,
            topic = %message.topic,
            status = ?message.status,
            "abandoned message reclaimed"
        );
        Ok(Reclaim::Requeued)
    }

    /// Make sure a Retrying or DeadLetter record is indexed in its set.
    /// Returns `true` if the index entry was missing and has been restored.
    fn ensure_parked(&self, message: &Message) -> QueueResult<bool> {
        let key = match message.status {
            MessageStatus::Retrying => self.ctx.keys.delayed(&message.topic),
            _ => self.ctx.keys.dead_letters(&message.topic),
        };
        if self.ctx.kv.zscore(&key, message.id.as_str())?.is_some() {
            return Ok(false);
        }
        if message.status == MessageStatus::Retrying {
            let delay = self.ctx.config.delay_for_retry(message.retry_count);
            let due_ms = message
                .updated_at
                .timestamp_millis()
                .saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX));
            self.ctx.kv.zadd(&key, message.id.as_str(), due_ms)?;
        } else {
            self.dead_letters.index(message)?;
        }
        Ok(true)
    }
}
