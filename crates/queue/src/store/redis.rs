//! Redis-backed key-value store (optional, `redis` feature).
//!
//! Every method is a single Redis command, except compare-and-delete which
//! runs as a Lua script so the check and the delete are atomic.

use std::sync::Arc;
use std::time::Duration;

use redis::Commands;

use super::KvStore;
use crate::error::{QueueError, QueueResult};

const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisKvStore {
    client: Arc<redis::Client>,
}

impl RedisKvStore {
    /// Create a store for `redis_url` (e.g. "redis://localhost:6379").
    ///
    /// No connection is opened until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::transport(format!("invalid redis url: {e}")))?;
        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn conn(&self) -> QueueResult<redis::Connection> {
        self.client
            .get_connection()
            .map_err(|e| QueueError::transport(format!("redis connection failed: {e}")))
    }
}

fn cmd_err(command: &'static str) -> impl Fn(redis::RedisError) -> QueueError {
    move |e| QueueError::transport(format!("{command} failed: {e}"))
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// `ZRANGEBYSCORE zset -inf max LIMIT 0 count`. Redis rejects counts above
/// `i64::MAX`, so "everything" is clamped.
fn zrange_by_score_cmd(zset: &str, max: i64, limit: usize) -> redis::Cmd {
    let mut cmd = redis::cmd("ZRANGEBYSCORE");
    cmd.arg(zset)
        .arg("-inf")
        .arg(max)
        .arg("LIMIT")
        .arg(0)
        .arg(i64::try_from(limit).unwrap_or(i64::MAX));
    cmd
}

impl KvStore for RedisKvStore {
    fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let mut conn = self.conn()?;
        conn.get(key).map_err(cmd_err("GET"))
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query::<()>(&mut conn).map_err(cmd_err("SET"))
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        // SET .. NX replies OK when set and nil otherwise.
        let reply: Option<String> = cmd.query(&mut conn).map_err(cmd_err("SET NX"))?;
        Ok(reply.is_some())
    }

    fn del(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.del(key).map_err(cmd_err("DEL"))?;
        Ok(removed > 0)
    }

    fn del_if_eq(&self, key: &str, expected: &str) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = redis::Script::new(DEL_IF_EQ_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke(&mut conn)
            .map_err(cmd_err("EVALSHA compare-and-delete"))?;
        Ok(removed > 0)
    }

    fn exists(&self, key: &str) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        conn.exists(key).map_err(cmd_err("EXISTS"))
    }

    fn rpush(&self, list: &str, value: &str) -> QueueResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn.rpush(list, value).map_err(cmd_err("RPUSH"))?;
        Ok(())
    }

    fn lrange(&self, list: &str, limit: usize) -> QueueResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let stop = isize::try_from(limit).unwrap_or(isize::MAX) - 1;
        conn.lrange(list, 0, stop).map_err(cmd_err("LRANGE"))
    }

    fn lrem(&self, list: &str, value: &str, count: usize) -> QueueResult<usize> {
        let mut conn = self.conn()?;
        let count = isize::try_from(count).unwrap_or(isize::MAX);
        conn.lrem(list, count, value).map_err(cmd_err("LREM"))
    }

    fn llen(&self, list: &str) -> QueueResult<usize> {
        let mut conn = self.conn()?;
        conn.llen(list).map_err(cmd_err("LLEN"))
    }

    fn sadd(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        let added: i64 = conn.sadd(set, member).map_err(cmd_err("SADD"))?;
        Ok(added > 0)
    }

    fn srem(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.srem(set, member).map_err(cmd_err("SREM"))?;
        Ok(removed > 0)
    }

    fn smembers(&self, set: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn()?;
        conn.smembers(set).map_err(cmd_err("SMEMBERS"))
    }

    fn scard(&self, set: &str) -> QueueResult<usize> {
        let mut conn = self.conn()?;
        conn.scard(set).map_err(cmd_err("SCARD"))
    }

    fn zadd(&self, zset: &str, member: &str, score: i64) -> QueueResult<()> {
        let mut conn = self.conn()?;
        let _: i64 = conn.zadd(zset, member, score).map_err(cmd_err("ZADD"))?;
        Ok(())
    }

    fn zrem(&self, zset: &str, member: &str) -> QueueResult<bool> {
        let mut conn = self.conn()?;
        let removed: i64 = conn.zrem(zset, member).map_err(cmd_err("ZREM"))?;
        Ok(removed > 0)
    }

    fn zscore(&self, zset: &str, member: &str) -> QueueResult<Option<i64>> {
        let mut conn = self.conn()?;
        let score: Option<f64> = conn.zscore(zset, member).map_err(cmd_err("ZSCORE"))?;
        Ok(score.map(|s| s as i64))
    }

    fn zrange_by_score(&self, zset: &str, max: i64, limit: usize) -> QueueResult<Vec<String>> {
        let mut conn = self.conn()?;
        zrange_by_score_cmd(zset, max, limit)
            .query(&mut conn)
            .map_err(cmd_err("ZRANGEBYSCORE"))
    }

    fn zrange(&self, zset: &str, offset: usize, limit: usize) -> QueueResult<Vec<String>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn()?;
        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = start.saturating_add(isize::try_from(limit).unwrap_or(isize::MAX) - 1);
        conn.zrange(zset, start, stop).map_err(cmd_err("ZRANGE"))
    }

    fn zcard(&self, zset: &str) -> QueueResult<usize> {
        let mut conn = self.conn()?;
        conn.zcard(zset).map_err(cmd_err("ZCARD"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(cmd: &redis::Cmd) -> String {
        String::from_utf8_lossy(&cmd.get_packed_command()).to_string()
    }

    #[test]
    fn unbounded_score_range_limit_fits_a_redis_integer() {
        let cmd = packed(&zrange_by_score_cmd("tf:delayed:emails", 42, usize::MAX));
        assert!(cmd.contains(&i64::MAX.to_string()));
        assert!(!cmd.contains(&usize::MAX.to_string()));
    }

    #[test]
    fn bounded_score_range_limit_is_passed_through() {
        let cmd = packed(&zrange_by_score_cmd("tf:delayed:emails", 42, 16));
        assert!(cmd.ends_with("$2\r\n16\r\n"));
    }
}
