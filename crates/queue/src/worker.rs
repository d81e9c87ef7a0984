//! Claiming, delivering and settling messages.
//!
//! A claim takes the per-message lock (`SET NX` with the processing timeout
//! as TTL), records the id as in-flight, and only then removes it from its
//! lane. Whoever removes the lane entry owns the delivery; everyone else
//! backs off. Ack and Nack first check that the caller's token still holds
//! the lock, so a worker whose lock expired cannot settle a message the
//! sweeper has already handed to someone else.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error, warn};

use trackflow_core::MessageId;

use crate::context::QueueContext;
use crate::dead_letter::DeadLetterManager;
use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, HandlerError, invoke};
use crate::message::{Message, MessageStatus, Priority, Topic};
use crate::retry::{NackOutcome, RetryScheduler};
use crate::router::Candidate;
use crate::runtime::RuntimeStats;

/// How many lane entries are inspected per slot in the batch. Entries
/// locked by other workers are skipped, so a claim looks past them.
const CANDIDATES_PER_SLOT: usize = 4;

/// Proof of a claim: the message id plus the token stored in its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: MessageId,
    pub topic: Topic,
    pub priority: Priority,
    token: String,
}

impl Lease {
    pub fn token(&self) -> &str {
        &self.token
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    ctx: Arc<QueueContext>,
    retry: RetryScheduler,
    dead_letters: DeadLetterManager,
    stats: Arc<Mutex<RuntimeStats>>,
    cursor: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub(crate) fn new(
        ctx: Arc<QueueContext>,
        retry: RetryScheduler,
        dead_letters: DeadLetterManager,
        stats: Arc<Mutex<RuntimeStats>>,
    ) -> Self {
        Self {
            ctx,
            retry,
            dead_letters,
            stats,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Claim up to `limit` pending messages of `topic`, highest priority first.
    pub fn claim(&self, worker: &str, topic: &Topic, limit: usize) -> QueueResult<Vec<(Lease, Message)>> {
        let mut claimed = Vec::new();
        if limit == 0 {
            return Ok(claimed);
        }
        let window = limit.saturating_mul(CANDIDATES_PER_SLOT);
        for candidate in self.ctx.router.candidates(topic, window)? {
            if claimed.len() == limit {
                break;
            }
            if let Some(hit) = self.try_claim(worker, topic, candidate)? {
                claimed.push(hit);
            }
        }
        Ok(claimed)
    }

    fn try_claim(
        &self,
        worker: &str,
        topic: &Topic,
        candidate: Candidate,
    ) -> QueueResult<Option<(Lease, Message)>> {
        let Candidate { id, priority } = candidate;
        let token = QueueContext::new_token(worker);
        if !self.ctx.try_lock(&id, &token)? {
            return Ok(None);
        }

        // From here on a failure leaves the lock to expire and the sweeper
        // to put the message back.
        let in_flight = self.ctx.keys.in_flight();
        self.ctx.kv.sadd(&in_flight, id.as_str())?;
        if self.ctx.router.take(topic, priority, &id)? == 0 {
            self.release(&id, &token)?;
            return Ok(None);
        }

        let mut message = match self.ctx.messages.get(&id) {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(message_id = %id, topic = %topic, "lane entry without record dropped");
                self.release(&id, &token)?;
                return Ok(None);
            }
            Err(QueueError::Serialization(_)) => {
                self.dead_letters.park_undecodable(topic, &id)?;
                self.release(&id, &token)?;
                return Ok(None);
            }
            Err(err) => return Err(err),
        };

        if message.status != MessageStatus::Pending {
            debug!(
                message_id = %id,
                status = ?message.status,
                "stale lane entry dropped"
            );
            self.release(&id, &token)?;
            return Ok(None);
        }

        message.mark_processing(self.ctx.clock.now());
        self.ctx.messages.put(&message)?;
        debug!(worker, message_id = %id, topic = %topic, priority = %priority, "claimed message");

        Ok(Some((
            Lease {
                id,
                topic: topic.clone(),
                priority,
                token,
            },
            message,
        )))
    }

    /// Mark the leased message completed.
    pub fn ack(&self, lease: &Lease) -> QueueResult<()> {
        self.ensure_lease(lease)?;
        let mut message = self.ctx.messages.load(&lease.id)?;
        message.mark_completed(self.ctx.clock.now());
        self.ctx.messages.put(&message)?;
        self.release(&lease.id, &lease.token)?;
        Ok(())
    }

    /// Record a failure for the leased message and schedule a retry or
    /// dead-letter it.
    pub fn nack(&self, lease: &Lease, error: &HandlerError) -> QueueResult<NackOutcome> {
        self.ensure_lease(lease)?;
        let mut message = self.ctx.messages.load(&lease.id)?;
        let outcome = self.retry.schedule(&mut message, error)?;
        self.release(&lease.id, &lease.token)?;
        Ok(outcome)
    }

    /// Ack a message by id without holding its lease. Only messages that are
    /// currently processing can be acked.
    pub fn force_ack(&self, id: &MessageId) -> QueueResult<()> {
        let mut message = self.processing(id)?;
        message.mark_completed(self.ctx.clock.now());
        self.ctx.messages.put(&message)?;
        self.force_release(id)
    }

    /// Nack a message by id without holding its lease.
    pub fn force_nack(&self, id: &MessageId, error: &HandlerError) -> QueueResult<NackOutcome> {
        let mut message = self.processing(id)?;
        let outcome = self.retry.schedule(&mut message, error)?;
        self.force_release(id)?;
        Ok(outcome)
    }

    fn processing(&self, id: &MessageId) -> QueueResult<Message> {
        match self.ctx.messages.get(id)? {
            Some(message) if message.status == MessageStatus::Processing => Ok(message),
            _ => Err(QueueError::NotFound(id.clone())),
        }
    }

    fn ensure_lease(&self, lease: &Lease) -> QueueResult<()> {
        if self.ctx.holds_lock(&lease.id, &lease.token)? {
            Ok(())
        } else {
            Err(QueueError::LeaseLost(lease.id.clone()))
        }
    }

    fn release(&self, id: &MessageId, token: &str) -> QueueResult<()> {
        self.ctx.kv.srem(&self.ctx.keys.in_flight(), id.as_str())?;
        self.ctx.unlock(id, token)?;
        Ok(())
    }

    fn force_release(&self, id: &MessageId) -> QueueResult<()> {
        self.ctx.kv.srem(&self.ctx.keys.in_flight(), id.as_str())?;
        self.ctx.kv.del(&self.ctx.keys.lock(id))?;
        Ok(())
    }

    /// Run `handler` on a claimed message and settle the outcome.
    ///
    /// A panicking handler counts as a failure. Settlement errors are logged,
    /// never propagated: the lock expires and the sweeper takes over.
    pub fn deliver(&self, worker: &str, lease: Lease, message: Message, handler: Handler) {
        let result = invoke(&handler, &message);

        let settled = match &result {
            Ok(()) => self.ack(&lease).map(|()| None),
            Err(err) => self.nack(&lease, err).map(Some),
        };

        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.processed += 1;
        match settled {
            Ok(None) => {
                stats.acked += 1;
                debug!(worker, message_id = %lease.id, "message acked");
            }
            Ok(Some(NackOutcome::Retrying { retry_count, .. })) => {
                stats.nacked += 1;
                stats.retried += 1;
                debug!(worker, message_id = %lease.id, retry_count, "message nacked");
            }
            Ok(Some(NackOutcome::DeadLettered)) => {
                stats.nacked += 1;
                stats.dead_lettered += 1;
            }
            Err(QueueError::LeaseLost(_)) => {
                stats.lease_lost += 1;
                warn!(worker, message_id = %lease.id, "lease expired before settlement; result discarded");
            }
            Err(err) => {
                error!(worker, message_id = %lease.id, error = %err, "failed to settle message");
            }
        }
    }

    /// Promote due retries, claim up to `batch_size` messages across the
    /// registered topics, and process them concurrently. Returns how many
    /// messages were delivered.
    pub fn poll_once(&self, worker: &str) -> QueueResult<usize> {
        let batch_size = self.ctx.config.batch_size;
        self.retry.promote_all_due(batch_size)?;

        let topics = self.ctx.handlers.topics();
        if topics.is_empty() {
            return Ok(0);
        }

        // Rotate the starting topic so one busy topic cannot starve the rest.
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % topics.len();
        let mut claimed = Vec::new();
        for offset in 0..topics.len() {
            let remaining = batch_size.saturating_sub(claimed.len());
            if remaining == 0 {
                break;
            }
            let topic = &topics[(start + offset) % topics.len()];
            match self.claim(worker, topic, remaining) {
                Ok(batch) => claimed.extend(batch),
                Err(err) if claimed.is_empty() => return Err(err),
                Err(err) => {
                    error!(worker, topic = %topic, error = %err, "claim failed");
                    break;
                }
            }
        }

        let delivered = claimed.len();
        let mut jobs = Vec::with_capacity(delivered);
        for (lease, message) in claimed {
            match self.ctx.handlers.get(&lease.topic) {
                Some(handler) => jobs.push((lease, message, handler)),
                None => {
                    let err = HandlerError::failed(format!("no handler for topic {}", lease.topic));
                    if let Err(e) = self.nack(&lease, &err) {
                        error!(worker, message_id = %lease.id, error = %e, "failed to nack unhandled message");
                    }
                }
            }
        }

        if jobs.len() <= 1 {
            for (lease, message, handler) in jobs {
                self.deliver(worker, lease, message, handler);
            }
            return Ok(delivered);
        }

        thread::scope(|scope| {
            for (lease, message, handler) in jobs {
                let spawned = thread::Builder::new()
                    .name(format!("{worker}-delivery"))
                    .spawn_scoped(scope, {
                        let lease = lease.clone();
                        let message = message.clone();
                        let handler = handler.clone();
                        move || self.deliver(worker, lease, message, handler)
                    });
                if let Err(e) = spawned {
                    warn!(worker, error = %e, "could not spawn delivery thread; running inline");
                    self.deliver(worker, lease, message, handler);
                }
            }
        });
        Ok(delivered)
    }
}
