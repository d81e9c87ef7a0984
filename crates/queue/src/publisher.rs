//! Publishing.

use std::sync::Arc;

use tracing::{debug, error};

use trackflow_core::MessageId;

use crate::context::QueueContext;
use crate::error::QueueResult;
use crate::message::{Message, PublishRequest};

#[derive(Clone)]
pub struct Publisher {
    ctx: Arc<QueueContext>,
}

impl Publisher {
    pub(crate) fn new(ctx: Arc<QueueContext>) -> Self {
        Self { ctx }
    }

    /// Store the record, then append its id to the priority lane.
    ///
    /// If the lane push fails the record is removed again, so a failed
    /// publish never leaves a record that no lane references.
    pub fn publish(&self, request: PublishRequest) -> QueueResult<MessageId> {
        let PublishRequest {
            id,
            topic,
            payload,
            priority,
            max_retries,
        } = request;
        let id = id.unwrap_or_else(MessageId::generate);
        let max_retries = max_retries.unwrap_or(self.ctx.config.default_max_retries);
        let message = Message::new(id, topic, payload, priority, max_retries, self.ctx.clock.now());

        self.ctx
            .kv
            .sadd(&self.ctx.keys.topics(), message.topic.as_str())?;
        self.ctx.messages.insert(&message)?;

        if let Err(err) = self.ctx.router.enqueue(&message) {
            if let Err(cleanup) = self.ctx.messages.delete(&message.id) {
                error!(
                    message_id = %message.id,
                    error = %cleanup,
                    "failed to remove record after lane push failure"
                );
            }
            return Err(err);
        }

        debug!(
            message_id = %message.id,
            topic = %message.topic,
            priority = %message.priority,
            "message published"
        );
        Ok(message.id)
    }
}
