//! Queue error taxonomy.

use thiserror::Error;

use trackflow_core::{DomainError, MessageId};

use crate::message::MessageStatus;

/// Result type used by every queue operation.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors surfaced to callers of the queue.
///
/// Exhausting the retry budget is not an error: it is reported through
/// [`crate::retry::NackOutcome::DeadLettered`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The payload (or a stored record) could not be encoded/decoded.
    /// Never retried.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The backing store could not be reached or rejected the command.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("message not found: {0}")]
    NotFound(MessageId),

    /// The active backend cannot perform this operation.
    #[error("operation `{operation}` is not supported by the {backend} backend")]
    Unsupported {
        backend: &'static str,
        operation: &'static str,
    },

    /// The caller's processing lock expired and was reclaimed (or reassigned)
    /// before it settled the message.
    #[error("processing lease lost for message {0}")]
    LeaseLost(MessageId),

    /// Another operation (delivery, promotion, replay) holds the message
    /// lock right now.
    #[error("message {0} is locked by another operation")]
    Busy(MessageId),

    #[error("message already exists: {0}")]
    AlreadyExists(MessageId),

    #[error("message {id} is {status:?}; operation requires {expected}")]
    InvalidState {
        id: MessageId,
        status: MessageStatus,
        expected: &'static str,
    },

    #[error("validation failed: {0}")]
    Validation(String),
}

impl QueueError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn unsupported(backend: &'static str, operation: &'static str) -> Self {
        Self::Unsupported { backend, operation }
    }

    /// Whether a caller may reasonably retry the same call later.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Transport(_) | QueueError::Busy(_))
    }
}

impl From<DomainError> for QueueError {
    fn from(value: DomainError) -> Self {
        QueueError::Validation(value.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(value: serde_json::Error) -> Self {
        QueueError::Serialization(value.to_string())
    }
}
