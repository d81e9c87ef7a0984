//! Shared key-value store abstraction.
//!
//! The queue only needs a handful of primitives: plain values with optional
//! TTL, atomic set-if-absent, compare-and-delete, lists (lanes), sets (the
//! in-flight index) and scored sets (delayed retries, dead letters). Redis
//! offers all of them natively; the in-memory store mirrors Redis semantics
//! closely enough for tests and single-process deployments.

use std::time::Duration;

use crate::error::QueueResult;

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use keys::Keys;
pub use memory::{InMemoryKvStore, KvOp};
#[cfg(feature = "redis")]
pub use self::redis::RedisKvStore;

/// Key-value store port used by every queue component.
///
/// Each method is atomic on its own; no multi-key transactions are assumed.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> QueueResult<Option<String>>;

    /// Overwrite `key`. `ttl = None` clears any previous expiry.
    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()>;

    /// Set `key` only if it does not exist. Returns whether the value was set.
    /// `ttl = None` means no expiry.
    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<bool>;

    /// Delete a key of any type. Returns whether it existed.
    fn del(&self, key: &str) -> QueueResult<bool>;

    /// Delete `key` only if it currently holds `expected`.
    fn del_if_eq(&self, key: &str, expected: &str) -> QueueResult<bool>;

    fn exists(&self, key: &str) -> QueueResult<bool>;

    /// Append to the tail of a list.
    fn rpush(&self, list: &str, value: &str) -> QueueResult<()>;

    /// First `limit` elements of a list, head first.
    fn lrange(&self, list: &str, limit: usize) -> QueueResult<Vec<String>>;

    /// Remove up to `count` occurrences of `value` from the head side
    /// (`count = 0` removes all). Returns how many were removed.
    fn lrem(&self, list: &str, value: &str, count: usize) -> QueueResult<usize>;

    fn llen(&self, list: &str) -> QueueResult<usize>;

    fn sadd(&self, set: &str, member: &str) -> QueueResult<bool>;

    fn srem(&self, set: &str, member: &str) -> QueueResult<bool>;

    fn smembers(&self, set: &str) -> QueueResult<Vec<String>>;

    fn scard(&self, set: &str) -> QueueResult<usize>;

    /// Insert or rescore a member.
    fn zadd(&self, zset: &str, member: &str, score: i64) -> QueueResult<()>;

    fn zrem(&self, zset: &str, member: &str) -> QueueResult<bool>;

    fn zscore(&self, zset: &str, member: &str) -> QueueResult<Option<i64>>;

    /// Members with `score <= max`, lowest score first, at most `limit`.
    fn zrange_by_score(&self, zset: &str, max: i64, limit: usize) -> QueueResult<Vec<String>>;

    /// Members ordered by (score, member), skipping `offset`, at most `limit`.
    fn zrange(&self, zset: &str, offset: usize, limit: usize) -> QueueResult<Vec<String>>;

    fn zcard(&self, zset: &str) -> QueueResult<usize>;
}
