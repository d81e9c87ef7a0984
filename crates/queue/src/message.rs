//! Message model and lifecycle transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use trackflow_core::{DomainError, MessageId};

use crate::error::{QueueError, QueueResult};

/// Application-defined message body: a JSON object.
pub type Payload = serde_json::Map<String, JsonValue>;

/// Convert any serializable value into a [`Payload`].
///
/// Fails fast with [`QueueError::Serialization`] when the value cannot be
/// encoded or does not encode to a JSON object.
pub fn payload_from<T: Serialize + ?Sized>(value: &T) -> QueueResult<Payload> {
    match serde_json::to_value(value)? {
        JsonValue::Object(map) => Ok(map),
        other => Err(QueueError::serialization(format!(
            "payload must encode to a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Delivery priority. Lanes are drained strictly in `High`, `Medium`, `Low`
/// order within a topic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// All priorities in drain order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for Priority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(DomainError::validation(format!("unknown priority: {other}"))),
        }
    }
}

/// Lifecycle state of a message.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting in its lane.
    Pending,
    /// Locked by a worker; the handler is running.
    Processing,
    /// Acked. Retained until the completed-retention TTL.
    Completed,
    /// Accepted on decode for records written by other producers; the local
    /// backend never writes it.
    Failed,
    /// Nacked and parked until its retry delay elapses.
    Retrying,
    /// Retry budget exhausted; waiting for replay or purge.
    DeadLetter,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MessageStatus::Completed | MessageStatus::DeadLetter)
    }
}

const MAX_TOPIC_LEN: usize = 64;

/// Logical channel name (e.g. `track_processing`).
///
/// Topics are embedded in store keys, so only ASCII alphanumerics, `_`, `-`
/// and `.` are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_TOPIC_LEN {
            return Err(DomainError::validation(format!(
                "topic must be 1..={MAX_TOPIC_LEN} characters"
            )));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(DomainError::validation(format!(
                "topic `{name}` contains characters outside [A-Za-z0-9_.-]"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Topic {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Topic {
    type Error = DomainError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Topic> for String {
    fn from(value: Topic) -> Self {
        value.0
    }
}

fn default_max_retries() -> u32 {
    crate::config::DEFAULT_MAX_RETRIES
}

/// The unit of work.
///
/// Serialized as `{id, type, data, status, retry_count, ...}`; `type` is the
/// topic and `data` the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    #[serde(rename = "type")]
    pub topic: Topic,
    #[serde(rename = "data")]
    pub payload: Payload,
    #[serde(default)]
    pub priority: Priority,
    pub status: MessageStatus,
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl Message {
    /// Build a new pending message.
    pub fn new(
        id: MessageId,
        topic: Topic,
        payload: Payload,
        priority: Priority,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            topic,
            payload,
            priority,
            status: MessageStatus::Pending,
            retry_count: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            processed_at: None,
            error_message: None,
        }
    }

    /// Whether another Nack may schedule a retry.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Processing;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Completed;
        self.processed_at = Some(now);
        self.updated_at = now;
    }

    /// Consume one unit of retry budget and park the message.
    pub fn mark_retrying(&mut self, error: String, now: DateTime<Utc>) {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.status = MessageStatus::Retrying;
        self.error_message = Some(error);
        self.updated_at = now;
    }

    pub fn mark_dead_letter(&mut self, error: String, now: DateTime<Utc>) {
        self.status = MessageStatus::DeadLetter;
        self.error_message = Some(error);
        self.updated_at = now;
    }

    /// Back to the lane (retry promotion or crash reclaim).
    pub fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Pending;
        self.updated_at = now;
    }

    /// Replay out of the dead-letter set with a fresh budget.
    pub fn reset_for_replay(&mut self, now: DateTime<Utc>) {
        self.status = MessageStatus::Pending;
        self.retry_count = 0;
        self.error_message = None;
        self.processed_at = None;
        self.updated_at = now;
    }
}

/// Input to [`crate::QueueService::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub id: Option<MessageId>,
    pub topic: Topic,
    pub payload: Payload,
    pub priority: Priority,
    pub max_retries: Option<u32>,
}

impl PublishRequest {
    pub fn new(topic: Topic, payload: Payload) -> Self {
        Self {
            id: None,
            topic,
            payload,
            priority: Priority::default(),
            max_retries: None,
        }
    }

    /// Validate the topic name and encode `payload` in one step.
    pub fn encode<T: Serialize + ?Sized>(topic: &str, payload: &T) -> QueueResult<Self> {
        let topic = Topic::new(topic)?;
        Ok(Self::new(topic, payload_from(payload)?))
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = Some(id);
        self
    }

    /// Override the queue-wide `default_max_retries` for this message.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}
