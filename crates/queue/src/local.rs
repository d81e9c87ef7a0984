//! Queue backend built on a [`KvStore`]: priority lanes, lock-based leases,
//! delayed retries, dead letters and crash recovery.

use std::sync::{Arc, Mutex};

use tracing::info;

use trackflow_core::{Clock, MessageId, SystemClock};

use crate::config::QueueConfig;
use crate::context::QueueContext;
use crate::dead_letter::DeadLetterManager;
use crate::error::QueueResult;
use crate::handler::{Handler, HandlerError};
use crate::message::{Message, PublishRequest, Topic};
use crate::publisher::Publisher;
use crate::retry::{NackOutcome, RetryScheduler};
use crate::router::LaneDepths;
use crate::runtime::{QueueRuntime, RuntimeStats};
use crate::service::QueueService;
use crate::store::{InMemoryKvStore, KvStore};
use crate::sweeper::{CleanupSweeper, SweepReport};
use crate::worker::WorkerPool;

/// Queue depth snapshot for one topic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TopicStats {
    pub topic: Topic,
    pub lanes: LaneDepths,
    pub in_flight: usize,
    pub delayed: usize,
    pub dead_letters: usize,
}

#[derive(Clone)]
pub struct LocalQueue {
    ctx: Arc<QueueContext>,
    publisher: Publisher,
    workers: WorkerPool,
    retry: RetryScheduler,
    dead_letters: DeadLetterManager,
    sweeper: CleanupSweeper,
    stats: Arc<Mutex<RuntimeStats>>,
}

impl LocalQueue {
    pub fn new(kv: Arc<dyn KvStore>, config: QueueConfig) -> Self {
        Self::with_clock(kv, config, Arc::new(SystemClock))
    }

    pub fn with_clock(kv: Arc<dyn KvStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let ctx = Arc::new(QueueContext::new(kv, config, clock));
        let stats = Arc::new(Mutex::new(RuntimeStats::default()));
        let dead_letters = DeadLetterManager::new(ctx.clone());
        let retry = RetryScheduler::new(ctx.clone(), dead_letters.clone());
        Self {
            publisher: Publisher::new(ctx.clone()),
            workers: WorkerPool::new(ctx.clone(), retry.clone(), dead_letters.clone(), stats.clone()),
            sweeper: CleanupSweeper::new(ctx.clone(), retry.clone(), dead_letters.clone()),
            retry,
            dead_letters,
            stats,
            ctx,
        }
    }

    /// Queue over a fresh in-memory store.
    pub fn in_memory(config: QueueConfig) -> Self {
        Self::new(InMemoryKvStore::arc(), config)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.ctx.config
    }

    /// Spawn `config.workers` worker threads plus the sweeper.
    pub fn start(&self) -> QueueResult<QueueRuntime> {
        QueueRuntime::spawn(
            self.workers.clone(),
            self.sweeper.clone(),
            self.ctx.config.workers,
            self.ctx.config.poll_interval,
            self.stats.clone(),
        )
    }

    /// One claim-and-deliver round on the calling thread.
    pub fn poll_once(&self) -> QueueResult<usize> {
        self.workers.poll_once("inline")
    }

    /// One sweeper pass on the calling thread.
    pub fn sweep_once(&self) -> QueueResult<SweepReport> {
        let report = self.sweeper.sweep_once()?;
        let mut stats = self.stats.lock().unwrap_or_else(|e| e.into_inner());
        stats.reclaimed += report.reclaimed as u64;
        Ok(report)
    }

    /// Delivery counters accumulated by this queue.
    pub fn runtime_stats(&self) -> RuntimeStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Fail a processing message and report what happened to it.
    pub fn nack_with_outcome(&self, id: &MessageId, error: HandlerError) -> QueueResult<NackOutcome> {
        self.workers.force_nack(id, &error)
    }

    pub fn stats(&self, topic: &Topic) -> QueueResult<TopicStats> {
        Ok(TopicStats {
            topic: topic.clone(),
            lanes: self.ctx.router.depths(topic)?,
            in_flight: self.in_flight_for(topic)?,
            delayed: self.retry.count(topic)?,
            dead_letters: self.dead_letters.count(topic)?,
        })
    }

    fn in_flight_for(&self, topic: &Topic) -> QueueResult<usize> {
        let mut count = 0;
        for raw in self.ctx.kv.smembers(&self.ctx.keys.in_flight())? {
            let Ok(id) = MessageId::parse(raw) else { continue };
            // Records that vanished or no longer decode are the sweeper's job.
            if let Ok(Some(message)) = self.ctx.messages.get(&id) {
                if &message.topic == topic {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Ids currently owned by a worker, across all topics.
    pub fn in_flight(&self) -> QueueResult<usize> {
        self.ctx.kv.scard(&self.ctx.keys.in_flight())
    }

    /// Every topic that has been published to.
    pub fn topics(&self) -> QueueResult<Vec<Topic>> {
        let mut topics: Vec<Topic> = self
            .ctx
            .kv
            .smembers(&self.ctx.keys.topics())?
            .into_iter()
            .filter_map(|raw| Topic::new(raw).ok())
            .collect();
        topics.sort();
        Ok(topics)
    }
}

impl QueueService for LocalQueue {
    fn backend(&self) -> &'static str {
        "local"
    }

    fn publish(&self, request: PublishRequest) -> QueueResult<MessageId> {
        self.publisher.publish(request)
    }

    fn subscribe(&self, topic: &Topic, handler: Handler) -> QueueResult<()> {
        self.ctx.handlers.register(topic.clone(), handler);
        info!(topic = %topic, "handler subscribed");
        Ok(())
    }

    fn ack_message(&self, id: &MessageId) -> QueueResult<()> {
        self.workers.force_ack(id)
    }

    fn nack_message(&self, id: &MessageId, error: &str) -> QueueResult<()> {
        self.workers.force_nack(id, &HandlerError::failed(error)).map(|_| ())
    }

    fn retry_message(&self, id: &MessageId) -> QueueResult<()> {
        self.retry.retry_now(id)
    }

    fn get_message(&self, id: &MessageId) -> QueueResult<Message> {
        self.ctx.messages.load(id)
    }

    fn list_dead_letters(&self, topic: &Topic, offset: usize, limit: usize) -> QueueResult<Vec<Message>> {
        self.dead_letters.list(topic, offset, limit)
    }

    fn replay_dead_letter(&self, id: &MessageId) -> QueueResult<()> {
        self.dead_letters.replay(id)
    }

    fn purge_dead_letters(&self, topic: &Topic) -> QueueResult<usize> {
        self.dead_letters.purge(topic)
    }
}
