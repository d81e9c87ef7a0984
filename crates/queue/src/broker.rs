//! Redis Streams backend (durable, at-least-once, `redis` feature).
//!
//! - **Streams**: one per topic and priority, `{prefix}:stream:{topic}:{priority}`
//! - **Consumer group**: `trackflow`, one consumer per process
//! - **Redelivery**: entries left pending longer than the processing timeout
//!   are taken over with `XCLAIM`; the delivery counter stands in for
//!   `retry_count`
//! - **Dead letters**: `{prefix}:stream:{topic}:dlq`, written once an entry has
//!   been delivered `max_retries + 1` times, and for entries whose payload
//!   does not decode (raw fields copied, original acknowledged)
//!
//! There is no per-message record here, so inspection, replay and manual
//! settlement are [`QueueError::Unsupported`].

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use tracing::{debug, error, info, warn};

use trackflow_core::{Clock, MessageId, SystemClock};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::handler::{Handler, HandlerRegistry, invoke};
use crate::message::{Message, Priority, PublishRequest, Topic};
use crate::service::QueueService;

const BACKEND: &str = "redis-streams";
const GROUP: &str = "trackflow";

/// Entry read from a stream. For redelivered entries `retry_count` holds
/// the number of earlier failed deliveries.
#[derive(Debug, Clone)]
struct StreamEntry {
    entry_id: String,
    message: Message,
}

struct Consumer {
    topic: Topic,
    shutdown: mpsc::Sender<()>,
    join: thread::JoinHandle<()>,
}

struct StreamsInner {
    client: redis::Client,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    handlers: HandlerRegistry,
    consumer_name: String,
    consumers: Mutex<Vec<Consumer>>,
}

#[derive(Clone)]
pub struct StreamsQueue {
    inner: Arc<StreamsInner>,
}

fn cmd_err(command: &'static str) -> impl Fn(redis::RedisError) -> QueueError {
    move |e| QueueError::transport(format!("{command} failed: {e}"))
}

impl StreamsQueue {
    /// Create a queue on `redis_url`. No connection is opened until first use.
    pub fn new(redis_url: impl AsRef<str>, config: QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::transport(format!("invalid redis url: {e}")))?;
        Ok(Self {
            inner: Arc::new(StreamsInner {
                client,
                config,
                clock: Arc::new(SystemClock),
                handlers: HandlerRegistry::new(),
                consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
                consumers: Mutex::new(Vec::new()),
            }),
        })
    }

    fn conn(&self) -> QueueResult<redis::Connection> {
        self.inner
            .client
            .get_connection()
            .map_err(|e| QueueError::transport(format!("redis connection failed: {e}")))
    }

    fn stream_key(&self, topic: &Topic, priority: Priority) -> String {
        format!("{}:stream:{}:{}", self.inner.config.key_prefix, topic, priority)
    }

    fn dlq_key(&self, topic: &Topic) -> String {
        format!("{}:stream:{}:dlq", self.inner.config.key_prefix, topic)
    }

    /// Create the consumer group on every lane of `topic` (idempotent).
    fn ensure_groups(&self, topic: &Topic) -> QueueResult<()> {
        let mut conn = self.conn()?;
        for priority in Priority::ALL {
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(self.stream_key(topic, priority))
                .arg(GROUP)
                .arg("0")
                .arg("MKSTREAM")
                .query(&mut conn);
            match created {
                Ok(_) => {}
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(cmd_err("XGROUP CREATE")(e)),
            }
        }
        Ok(())
    }

    /// One delivery round for `topic`: the highest priority lane with work
    /// wins. Returns the number of entries delivered.
    pub fn poll_topic(&self, topic: &Topic) -> QueueResult<usize> {
        let Some(handler) = self.inner.handlers.get(topic) else {
            return Ok(0);
        };
        let mut conn = self.conn()?;
        for priority in Priority::ALL {
            let stream = self.stream_key(topic, priority);
            let mut batch = self.claim_idle(&mut conn, &stream)?;
            if batch.is_empty() {
                batch = self.read_new(&mut conn, &stream)?;
            }
            if batch.is_empty() {
                continue;
            }
            let delivered = batch.len();
            for parsed in batch {
                match parsed {
                    ParsedEntry::Decoded(entry) => {
                        self.deliver(&mut conn, topic, &stream, entry, &handler)?
                    }
                    ParsedEntry::Undecodable(raw) => self.quarantine(&mut conn, topic, &stream, &raw)?,
                }
            }
            return Ok(delivered);
        }
        Ok(0)
    }

    /// Take over entries other consumers left pending past the timeout.
    fn claim_idle(&self, conn: &mut redis::Connection, stream: &str) -> QueueResult<Vec<ParsedEntry>> {
        let min_idle = self.inner.config.processing_timeout.as_millis() as u64;
        let pending: Vec<(String, String, u64, u64)> = redis::cmd("XPENDING")
            .arg(stream)
            .arg(GROUP)
            .arg("IDLE")
            .arg(min_idle)
            .arg("-")
            .arg("+")
            .arg(self.inner.config.batch_size)
            .query(conn)
            .map_err(cmd_err("XPENDING"))?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let deliveries: HashMap<String, u64> = pending
            .into_iter()
            .map(|(id, _consumer, _idle, count)| (id, count))
            .collect();
        let ids: Vec<String> = deliveries.keys().cloned().collect();
        let claimed: Vec<redis::Value> = redis::cmd("XCLAIM")
            .arg(stream)
            .arg(GROUP)
            .arg(&self.inner.consumer_name)
            .arg(min_idle)
            .arg(&ids[..])
            .query(conn)
            .map_err(cmd_err("XCLAIM"))?;

        let mut out = Vec::new();
        for value in claimed {
            match parse_entry(value) {
                Some(ParsedEntry::Decoded(mut entry)) => {
                    let failures = deliveries.get(&entry.entry_id).copied().unwrap_or(0);
                    entry.message.retry_count = u32::try_from(failures).unwrap_or(u32::MAX);
                    out.push(ParsedEntry::Decoded(entry));
                }
                Some(raw) => out.push(raw),
                None => {}
            }
        }
        Ok(out)
    }

    fn read_new(&self, conn: &mut redis::Connection, stream: &str) -> QueueResult<Vec<ParsedEntry>> {
        let reply: Option<Vec<(String, Vec<redis::Value>)>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(GROUP)
            .arg(&self.inner.consumer_name)
            .arg("COUNT")
            .arg(self.inner.config.batch_size)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query(conn)
            .map_err(cmd_err("XREADGROUP"))?;

        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_stream, entries)| entries)
            .filter_map(parse_entry)
            .collect())
    }

    fn deliver(
        &self,
        conn: &mut redis::Connection,
        topic: &Topic,
        stream: &str,
        entry: StreamEntry,
        handler: &Handler,
    ) -> QueueResult<()> {
        let StreamEntry { entry_id, mut message } = entry;
        if message.retry_count > message.max_retries {
            return self.dead_letter(conn, stream, &entry_id, message, "delivery attempts exhausted");
        }

        message.mark_processing(self.inner.clock.now());
        match invoke(handler, &message) {
            Ok(()) => {
                let _: u64 = redis::cmd("XACK")
                    .arg(stream)
                    .arg(GROUP)
                    .arg(&entry_id)
                    .query(conn)
                    .map_err(cmd_err("XACK"))?;
                debug!(message_id = %message.id, topic = %topic, "message acked");
                Ok(())
            }
            Err(err) if err.is_permanent() => {
                self.dead_letter(conn, stream, &entry_id, message, &err.to_string())
            }
            Err(err) => {
                // Left pending; XCLAIM redelivers it after the timeout.
                debug!(
                    message_id = %message.id,
                    topic = %topic,
                    retry_count = message.retry_count,
                    error = %err,
                    "delivery failed"
                );
                Ok(())
            }
        }
    }

    fn dead_letter(
        &self,
        conn: &mut redis::Connection,
        stream: &str,
        entry_id: &str,
        mut message: Message,
        reason: &str,
    ) -> QueueResult<()> {
        message.retry_count = message.retry_count.min(message.max_retries);
        message.mark_dead_letter(reason.to_string(), self.inner.clock.now());
        let payload = serde_json::to_string(&message)?;

        let _: String = redis::cmd("XADD")
            .arg(self.dlq_key(&message.topic))
            .arg("*")
            .arg("original_entry_id")
            .arg(entry_id)
            .arg("message")
            .arg(&payload)
            .query(conn)
            .map_err(cmd_err("DLQ XADD"))?;
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(GROUP)
            .arg(entry_id)
            .query(conn)
            .map_err(cmd_err("XACK"))?;

        warn!(
            message_id = %message.id,
            topic = %message.topic,
            retry_count = message.retry_count,
            reason,
            "message dead-lettered"
        );
        Ok(())
    }

    /// Undecodable entries would otherwise sit in the pending list forever.
    fn quarantine(
        &self,
        conn: &mut redis::Connection,
        topic: &Topic,
        stream: &str,
        raw: &RawEntry,
    ) -> QueueResult<()> {
        let _: String = quarantine_cmd(&self.dlq_key(topic), raw)
            .query(conn)
            .map_err(cmd_err("DLQ XADD"))?;
        let _: u64 = redis::cmd("XACK")
            .arg(stream)
            .arg(GROUP)
            .arg(&raw.entry_id)
            .query(conn)
            .map_err(cmd_err("XACK"))?;
        error!(
            entry_id = %raw.entry_id,
            topic = %topic,
            error = %raw.reason,
            "undecodable stream entry dead-lettered"
        );
        Ok(())
    }

    fn spawn_consumer(&self, topic: &Topic) -> QueueResult<()> {
        let mut consumers = self.inner.consumers.lock().unwrap_or_else(|e| e.into_inner());
        if consumers.iter().any(|c| &c.topic == topic) {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<()>();
        let queue = self.clone();
        let thread_topic = topic.clone();
        let interval = self.inner.config.poll_interval;
        let join = thread::Builder::new()
            .name(format!("trackflow-streams-{topic}"))
            .spawn(move || {
                info!(topic = %thread_topic, "streams consumer started");
                loop {
                    let idle = match queue.poll_topic(&thread_topic) {
                        Ok(n) => n == 0,
                        Err(e) => {
                            error!(topic = %thread_topic, error = %e, "streams poll failed");
                            true
                        }
                    };
                    let stop = if idle {
                        !matches!(rx.recv_timeout(interval), Err(mpsc::RecvTimeoutError::Timeout))
                    } else {
                        !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
                    };
                    if stop {
                        break;
                    }
                }
                info!(topic = %thread_topic, "streams consumer stopped");
            })
            .map_err(|e| QueueError::transport(format!("failed to spawn consumer thread: {e}")))?;

        consumers.push(Consumer {
            topic: topic.clone(),
            shutdown: tx,
            join,
        });
        Ok(())
    }

    /// Stop every consumer thread and wait for its current batch.
    pub fn shutdown(&self) {
        let consumers: Vec<Consumer> = {
            let mut guard = self.inner.consumers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for consumer in &consumers {
            let _ = consumer.shutdown.send(());
        }
        for consumer in consumers {
            let _ = consumer.join.join();
        }
    }
}

/// Parse `[entry_id, [field, value, ...]]` and decode its `message` field.
/// Stream entry whose `message` field is missing or does not decode. Its raw
/// fields are kept so it can be moved to the dead-letter stream as-is.
#[derive(Debug, Clone, PartialEq)]
struct RawEntry {
    entry_id: String,
    fields: Vec<(Vec<u8>, Vec<u8>)>,
    reason: String,
}

#[derive(Debug)]
enum ParsedEntry {
    Decoded(StreamEntry),
    Undecodable(RawEntry),
}

/// `None` only when the reply carries no entry id, so there is nothing to
/// acknowledge (XCLAIM answers nil for entries deleted meanwhile).
fn parse_entry(value: redis::Value) -> Option<ParsedEntry> {
    let redis::Value::Bulk(parts) = value else {
        return None;
    };
    let mut parts = parts.into_iter();
    let entry_id = match parts.next()? {
        redis::Value::Data(bytes) => String::from_utf8_lossy(&bytes).to_string(),
        _ => return None,
    };
    let fields: Vec<(Vec<u8>, Vec<u8>)> = match parts.next() {
        Some(redis::Value::Bulk(values)) => values
            .chunks(2)
            .filter_map(|pair| match pair {
                [redis::Value::Data(key), redis::Value::Data(value)] => {
                    Some((key.clone(), value.clone()))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    let decoded = match fields.iter().find(|(key, _)| key.as_slice() == b"message") {
        Some((_, record)) => serde_json::from_slice::<Message>(record).map_err(|e| e.to_string()),
        None => Err("missing `message` field".to_string()),
    };
    Some(match decoded {
        Ok(message) => ParsedEntry::Decoded(StreamEntry { entry_id, message }),
        Err(reason) => ParsedEntry::Undecodable(RawEntry { entry_id, fields, reason }),
    })
}

/// XADD of an undecodable entry to the dead-letter stream, with the original
/// fields copied verbatim after the entry id and decode error.
fn quarantine_cmd(dlq: &str, raw: &RawEntry) -> redis::Cmd {
    let mut cmd = redis::cmd("XADD");
    cmd.arg(dlq)
        .arg("*")
        .arg("original_entry_id")
        .arg(&raw.entry_id)
        .arg("error")
        .arg(&raw.reason);
    for (key, value) in &raw.fields {
        cmd.arg(&key[..]).arg(&value[..]);
    }
    cmd
}

impl QueueService for StreamsQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn publish(&self, request: PublishRequest) -> QueueResult<MessageId> {
        let PublishRequest {
            id,
            topic,
            payload,
            priority,
            max_retries,
        } = request;
        let id = id.unwrap_or_else(MessageId::generate);
        let max_retries = max_retries.unwrap_or(self.inner.config.default_max_retries);
        let message = Message::new(id, topic, payload, priority, max_retries, self.inner.clock.now());
        let record = serde_json::to_string(&message)?;

        let mut conn = self.conn()?;
        let _: String = redis::cmd("XADD")
            .arg(self.stream_key(&message.topic, message.priority))
            .arg("*")
            .arg("id")
            .arg(message.id.as_str())
            .arg("message")
            .arg(&record)
            .query(&mut conn)
            .map_err(cmd_err("XADD"))?;

        debug!(
            message_id = %message.id,
            topic = %message.topic,
            priority = %message.priority,
            "message published"
        );
        Ok(message.id)
    }

    fn subscribe(&self, topic: &Topic, handler: Handler) -> QueueResult<()> {
        self.ensure_groups(topic)?;
        self.inner.handlers.register(topic.clone(), handler);
        self.spawn_consumer(topic)
    }

    fn ack_message(&self, _id: &MessageId) -> QueueResult<()> {
        Err(QueueError::unsupported(BACKEND, "ack_message"))
    }

    fn nack_message(&self, _id: &MessageId, _error: &str) -> QueueResult<()> {
        Err(QueueError::unsupported(BACKEND, "nack_message"))
    }

    fn retry_message(&self, _id: &MessageId) -> QueueResult<()> {
        Err(QueueError::unsupported(BACKEND, "retry_message"))
    }

    fn get_message(&self, _id: &MessageId) -> QueueResult<Message> {
        Err(QueueError::unsupported(BACKEND, "get_message"))
    }

    fn list_dead_letters(&self, _topic: &Topic, _offset: usize, _limit: usize) -> QueueResult<Vec<Message>> {
        Err(QueueError::unsupported(BACKEND, "list_dead_letters"))
    }

    fn replay_dead_letter(&self, _id: &MessageId) -> QueueResult<()> {
        Err(QueueError::unsupported(BACKEND, "replay_dead_letter"))
    }

    fn purge_dead_letters(&self, _topic: &Topic) -> QueueResult<usize> {
        Err(QueueError::unsupported(BACKEND, "purge_dead_letters"))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::payload_from;

    fn queue() -> StreamsQueue {
        // Client::open only parses the URL; nothing connects in these tests.
        StreamsQueue::new("redis://127.0.0.1:6379", QueueConfig::default()).unwrap()
    }

    #[test]
    fn inspection_operations_are_unsupported() {
        let queue = queue();
        let id = MessageId::generate();
        let topic = Topic::new("track_processing").unwrap();

        for result in [
            queue.ack_message(&id),
            queue.nack_message(&id, "x"),
            queue.retry_message(&id),
            queue.replay_dead_letter(&id),
        ] {
            assert!(matches!(
                result,
                Err(QueueError::Unsupported { backend: "redis-streams", .. })
            ));
        }
        assert!(matches!(
            queue.list_dead_letters(&topic, 0, 10),
            Err(QueueError::Unsupported { operation: "list_dead_letters", .. })
        ));
        assert!(matches!(
            queue.purge_dead_letters(&topic),
            Err(QueueError::Unsupported { .. })
        ));
    }

    #[test]
    fn parses_stream_entries() {
        let message = Message::new(
            MessageId::parse("m-1").unwrap(),
            Topic::new("t").unwrap(),
            payload_from(&json!({"track_id": "abc"})).unwrap(),
            Priority::High,
            3,
            chrono::Utc::now(),
        );
        let record = serde_json::to_vec(&message).unwrap();
        let value = redis::Value::Bulk(vec![
            redis::Value::Data(b"1700000000000-0".to_vec()),
            redis::Value::Bulk(vec![
                redis::Value::Data(b"id".to_vec()),
                redis::Value::Data(b"m-1".to_vec()),
                redis::Value::Data(b"message".to_vec()),
                redis::Value::Data(record),
            ]),
        ]);

        let Some(ParsedEntry::Decoded(entry)) = parse_entry(value) else {
            panic!("expected a decoded entry");
        };
        assert_eq!(entry.entry_id, "1700000000000-0");
        assert_eq!(entry.message, message);
    }

    #[test]
    fn undecodable_entries_keep_their_id_and_raw_fields() {
        let value = redis::Value::Bulk(vec![
            redis::Value::Data(b"1700000000000-1".to_vec()),
            redis::Value::Bulk(vec![
                redis::Value::Data(b"id".to_vec()),
                redis::Value::Data(b"m-2".to_vec()),
                redis::Value::Data(b"message".to_vec()),
                redis::Value::Data(b"{not json".to_vec()),
            ]),
        ]);

        let Some(ParsedEntry::Undecodable(raw)) = parse_entry(value) else {
            panic!("expected an undecodable entry");
        };
        assert_eq!(raw.entry_id, "1700000000000-1");
        assert_eq!(
            raw.fields,
            vec![
                (b"id".to_vec(), b"m-2".to_vec()),
                (b"message".to_vec(), b"{not json".to_vec()),
            ]
        );

        let packed = String::from_utf8_lossy(
            &quarantine_cmd("trackflow:stream:batch:dlq", &raw).get_packed_command(),
        )
        .to_string();
        assert!(packed.contains("trackflow:stream:batch:dlq"));
        assert!(packed.contains("1700000000000-1"));
        assert!(packed.contains("{not json"));
    }

    #[test]
    fn entries_without_a_message_field_are_undecodable() {
        let value = redis::Value::Bulk(vec![
            redis::Value::Data(b"1700000000000-2".to_vec()),
            redis::Value::Bulk(vec![
                redis::Value::Data(b"id".to_vec()),
                redis::Value::Data(b"m-3".to_vec()),
            ]),
        ]);
        assert!(matches!(
            parse_entry(value),
            Some(ParsedEntry::Undecodable(RawEntry { ref entry_id, .. })) if entry_id == "1700000000000-2"
        ));
        assert!(parse_entry(redis::Value::Nil).is_none());
    }

    #[test]
    fn stream_keys_are_per_topic_and_priority() {
        let queue = queue();
        let topic = Topic::new("batch").unwrap();
        assert_eq!(queue.stream_key(&topic, Priority::Low), "trackflow:stream:batch:low");
        assert_eq!(queue.dlq_key(&topic), "trackflow:stream:batch:dlq");
    }
}
