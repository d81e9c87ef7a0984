//! State shared by every queue component.

use std::sync::Arc;

use uuid::Uuid;

use trackflow_core::{Clock, MessageId};

use crate::config::QueueConfig;
use crate::error::QueueResult;
use crate::handler::HandlerRegistry;
use crate::message_store::MessageStore;
use crate::router::PriorityRouter;
use crate::store::{Keys, KvStore};

/// One queue instance: its store, configuration, clock and handler map.
///
/// Components hold an `Arc<QueueContext>`; nothing here is process-global.
pub(crate) struct QueueContext {
    pub(crate) kv: Arc<dyn KvStore>,
    pub(crate) keys: Keys,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: QueueConfig,
    pub(crate) messages: MessageStore,
    pub(crate) router: PriorityRouter,
    pub(crate) handlers: HandlerRegistry,
}

impl QueueContext {
    pub(crate) fn new(kv: Arc<dyn KvStore>, config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        let keys = Keys::new(config.key_prefix.clone());
        let messages = MessageStore::new(
            kv.clone(),
            keys.clone(),
            config.completed_ttl,
            config.dead_letter_ttl,
        );
        let router = PriorityRouter::new(kv.clone(), keys.clone());
        Self {
            kv,
            keys,
            clock,
            config,
            messages,
            router,
            handlers: HandlerRegistry::new(),
        }
    }

    /// Fresh lease token for `owner` (worker name, "sweeper", ...).
    pub(crate) fn new_token(owner: &str) -> String {
        format!("{owner}:{}", Uuid::now_v7())
    }

    /// Take the per-message lock; `false` means someone else owns it.
    pub(crate) fn try_lock(&self, id: &MessageId, token: &str) -> QueueResult<bool> {
        self.kv
            .set_nx(&self.keys.lock(id), token, Some(self.config.processing_timeout))
    }

    /// Release the lock if `token` still owns it.
    pub(crate) fn unlock(&self, id: &MessageId, token: &str) -> QueueResult<bool> {
        self.kv.del_if_eq(&self.keys.lock(id), token)
    }

    /// Whether `token` still holds the lock for `id`.
    pub(crate) fn holds_lock(&self, id: &MessageId, token: &str) -> QueueResult<bool> {
        Ok(self.kv.get(&self.keys.lock(id))?.as_deref() == Some(token))
    }
}
