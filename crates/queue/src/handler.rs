//! Topic handlers.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::warn;

use crate::message::{Message, Topic};

/// Why a handler refused a message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HandlerError {
    /// Ordinary failure; the message is retried while budget remains.
    #[error("{0}")]
    Failed(String),

    /// The payload cannot be understood; retrying will not help, so the
    /// message goes straight to the dead-letter set.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Malformed(_))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(value: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{value:#}"))
    }
}

/// Decoding the payload into a typed struct failed.
impl From<serde_json::Error> for HandlerError {
    fn from(value: serde_json::Error) -> Self {
        HandlerError::Malformed(value.to_string())
    }
}

pub type HandlerResult = Result<(), HandlerError>;

/// Processes one message. Invoked from worker threads, possibly several at
/// once for the same topic.
pub type Handler = Arc<dyn Fn(&Message) -> HandlerResult + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Message) -> HandlerResult + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Run `handler`, turning a panic into [`HandlerError::Failed`].
pub(crate) fn invoke(handler: &Handler, message: &Message) -> HandlerResult {
    panic::catch_unwind(AssertUnwindSafe(|| handler(message)))
        .unwrap_or_else(|payload| Err(HandlerError::failed(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}

/// Topic -> handler map. One handler per topic.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Topic, Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`, replacing any previous one.
    pub fn register(&self, topic: Topic, handler: Handler) -> Option<Handler> {
        let mut map = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        let previous = map.insert(topic.clone(), handler);
        if previous.is_some() {
            warn!(topic = %topic, "handler replaced");
        }
        previous
    }

    pub fn get(&self, topic: &Topic) -> Option<Handler> {
        let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        map.get(topic).cloned()
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<Topic> {
        let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        let mut topics: Vec<Topic> = map.keys().cloned().collect();
        topics.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        topics
    }

    pub fn is_empty(&self) -> bool {
        let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_replaces_previous_handler() {
        let registry = HandlerRegistry::new();
        let topic = Topic::new("emails").unwrap();

        assert!(registry.register(topic.clone(), handler(|_| Ok(()))).is_none());
        assert!(
            registry
                .register(topic.clone(), handler(|_| Err(HandlerError::failed("x"))))
                .is_some()
        );
        assert_eq!(registry.topics(), vec![topic]);
    }

    #[test]
    fn panics_become_failures() {
        let h = handler(|_| panic!("boom"));
        let msg = Message::new(
            trackflow_core::MessageId::generate(),
            Topic::new("emails").unwrap(),
            Default::default(),
            Default::default(),
            3,
            chrono::Utc::now(),
        );
        assert_eq!(
            invoke(&h, &msg),
            Err(HandlerError::failed("handler panicked: boom"))
        );
    }

    #[test]
    fn decode_failures_are_permanent() {
        let err: HandlerError = serde_json::from_str::<u32>("\"nope\"").unwrap_err().into();
        assert!(err.is_permanent());

        let err: HandlerError = anyhow::anyhow!("db down").into();
        assert!(!err.is_permanent());
        assert_eq!(err.to_string(), "db down");
    }
}
