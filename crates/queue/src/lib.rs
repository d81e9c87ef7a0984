//! Durable job/message queue with priorities, retries and dead letters.
//!
//! ## Design
//!
//! - At-least-once delivery; handlers must be idempotent
//! - Strict High > Medium > Low priority within a topic
//! - Per-message processing lock (`SET NX` + TTL) as the only synchronization
//! - Fixed retry delay table, then a per-topic dead-letter set
//! - A sweeper reclaims messages whose worker died holding the lock
//!
//! ## Components
//!
//! - `LocalQueue`: the full-featured backend over any [`KvStore`]
//! - `StreamsQueue`: Redis Streams consumer-group backend (`redis` feature)
//! - `QueueService`: the contract both implement

pub mod config;
pub mod dead_letter;
pub mod error;
pub mod handler;
pub mod local;
pub mod message;
pub mod message_store;
pub mod publisher;
pub mod retry;
pub mod router;
pub mod runtime;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod worker;

#[cfg(feature = "redis")]
pub mod broker;

mod context;


pub use config::QueueConfig;
pub use dead_letter::DeadLetterManager;
pub use error::{QueueError, QueueResult};
pub use handler::{Handler, HandlerError, HandlerRegistry, HandlerResult, handler};
pub use local::{LocalQueue, TopicStats};
pub use message::{Message, MessageStatus, Payload, Priority, PublishRequest, Topic, payload_from};
pub use message_store::MessageStore;
pub use retry::{NackOutcome, RetryScheduler};
pub use router::{LaneDepths, PriorityRouter};
pub use runtime::{QueueRuntime, RuntimeStats};
pub use service::QueueService;
pub use store::{InMemoryKvStore, KvOp, KvStore};
pub use sweeper::{CleanupSweeper, SweepReport};
pub use worker::{Lease, WorkerPool};

#[cfg(feature = "redis")]
pub use broker::StreamsQueue;
#[cfg(feature = "redis")]
pub use store::RedisKvStore;

pub use trackflow_core::MessageId;
