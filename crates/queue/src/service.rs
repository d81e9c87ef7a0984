//! Backend-agnostic queue interface.

use std::sync::Arc;

use trackflow_core::MessageId;

use crate::error::QueueResult;
use crate::handler::Handler;
use crate::message::{Message, PublishRequest, Topic};

/// Operations every queue backend exposes.
///
/// Backends that cannot perform an operation return
/// [`crate::QueueError::Unsupported`] instead of silently doing nothing.
pub trait QueueService: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    fn publish(&self, request: PublishRequest) -> QueueResult<MessageId>;

    /// Register the handler for `topic`. Replaces any previous handler.
    fn subscribe(&self, topic: &Topic, handler: Handler) -> QueueResult<()>;

    /// Complete a processing message out-of-band.
    fn ack_message(&self, id: &MessageId) -> QueueResult<()>;

    /// Fail a processing message out-of-band.
    fn nack_message(&self, id: &MessageId, error: &str) -> QueueResult<()>;

    /// Re-enqueue a retrying message now instead of waiting for its delay.
    fn retry_message(&self, id: &MessageId) -> QueueResult<()>;

    fn get_message(&self, id: &MessageId) -> QueueResult<Message>;

    fn list_dead_letters(&self, topic: &Topic, offset: usize, limit: usize) -> QueueResult<Vec<Message>>;

    fn replay_dead_letter(&self, id: &MessageId) -> QueueResult<()>;

    fn purge_dead_letters(&self, topic: &Topic) -> QueueResult<usize>;
}

impl<Q> QueueService for Arc<Q>
where
    Q: QueueService + ?Sized,
{
    fn backend(&self) -> &'static str {
        (**self).backend()
    }

    fn publish(&self, request: PublishRequest) -> QueueResult<MessageId> {
        (**self).publish(request)
    }

    fn subscribe(&self, topic: &Topic, handler: Handler) -> QueueResult<()> {
        (**self).subscribe(topic, handler)
    }

    fn ack_message(&self, id: &MessageId) -> QueueResult<()> {
        (**self).ack_message(id)
    }

    fn nack_message(&self, id: &MessageId, error: &str) -> QueueResult<()> {
        (**self).nack_message(id, error)
    }

    fn retry_message(&self, id: &MessageId) -> QueueResult<()> {
        (**self).retry_message(id)
    }

    fn get_message(&self, id: &MessageId) -> QueueResult<Message> {
        (**self).get_message(id)
    }

    fn list_dead_letters(&self, topic: &Topic, offset: usize, limit: usize) -> QueueResult<Vec<Message>> {
        (**self).list_dead_letters(topic, offset, limit)
    }

    fn replay_dead_letter(&self, id: &MessageId) -> QueueResult<()> {
        (**self).replay_dead_letter(id)
    }

    fn purge_dead_letters(&self, topic: &Topic) -> QueueResult<usize> {
        (**self).purge_dead_letters(topic)
    }
}
