//! Store key layout.
//!
//! ```text
//! {prefix}:msg:{id}                 message record (JSON)
//! {prefix}:lock:{id}                processing lock, value = lease token
//! {prefix}:lane:{topic}:{priority}  pending lane (list of ids)
//! {prefix}:inflight                 ids currently owned by a worker (set)
//! {prefix}:delayed:{topic}          ids waiting for a retry (scored by due ms)
//! {prefix}:dlq:{topic}              dead-lettered ids (scored by created_at ms)
//! {prefix}:topics                   every topic ever published to (set)
//! ```

use trackflow_core::MessageId;

use crate::message::{Priority, Topic};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn message(&self, id: &MessageId) -> String {
        format!("{}:msg:{}", self.prefix, id)
    }

    pub fn lock(&self, id: &MessageId) -> String {
        format!("{}:lock:{}", self.prefix, id)
    }

    pub fn lane(&self, topic: &Topic, priority: Priority) -> String {
        format!("{}:lane:{}:{}", self.prefix, topic, priority.as_str())
    }

    pub fn in_flight(&self) -> String {
        format!("{}:inflight", self.prefix)
    }

    pub fn delayed(&self, topic: &Topic) -> String {
        format!("{}:delayed:{}", self.prefix, topic)
    }

    pub fn dead_letters(&self, topic: &Topic) -> String {
        format!("{}:dlq:{}", self.prefix, topic)
    }

    pub fn topics(&self) -> String {
        format!("{}:topics", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        let keys = Keys::new("tf");
        let topic = Topic::new("track_processing").unwrap();
        let id = MessageId::parse("m1").unwrap();

        assert_eq!(keys.message(&id), "tf:msg:m1");
        assert_eq!(keys.lock(&id), "tf:lock:m1");
        assert_eq!(keys.lane(&topic, Priority::High), "tf:lane:track_processing:high");
        assert_eq!(keys.dead_letters(&topic), "tf:dlq:track_processing");
        assert_eq!(keys.delayed(&topic), "tf:delayed:track_processing");
    }
}
