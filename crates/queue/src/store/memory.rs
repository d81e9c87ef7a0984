//! In-memory key-value store for tests/dev and single-process deployments.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use trackflow_core::{Clock, SystemClock};

use super::KvStore;
use crate::error::{QueueError, QueueResult};

/// Operation classes that can be made to fail on purpose.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum KvOp {
    Get,
    Set,
    SetNx,
    Del,
    ListPush,
    ListRead,
    ListRemove,
    SetAdd,
    SetRemove,
    SetRead,
    ZAdd,
    ZRemove,
    ZRead,
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
    ZSet(BTreeMap<String, i64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    faults: HashSet<KvOp>,
    unavailable: bool,
}

impl State {
    /// Drop `key` if its TTL elapsed.
    fn evict_expired(&mut self, key: &str, now: DateTime<Utc>) {
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
    }

    fn check(&self, op: KvOp) -> QueueResult<()> {
        if self.unavailable {
            return Err(QueueError::transport("in-memory store unavailable"));
        }
        if self.faults.contains(&op) {
            return Err(QueueError::transport(format!("injected fault on {op:?}")));
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> QueueError {
    QueueError::transport(format!(
        "WRONGTYPE operation against key `{key}` holding the wrong kind of value"
    ))
}

/// Mutex-guarded map with Redis-like semantics.
///
/// - TTLs are evaluated lazily against the injected [`Clock`]
/// - Empty lists/sets are removed, like Redis does
/// - Faults can be injected per operation class to exercise transport errors
pub struct InMemoryKvStore {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make every operation of class `op` fail with a transport error.
    pub fn inject_fault(&self, op: KvOp) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.insert(op);
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.faults.clear();
            state.unavailable = false;
        }
    }

    /// Simulate a full outage.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Number of live keys (test helper).
    pub fn key_count(&self) -> usize {
        let now = self.clock.now();
        self.state
            .lock()
            .map(|s| {
                s.entries
                    .values()
                    .filter(|e| e.expires_at.is_none_or(|at| at > now))
                    .count()
            })
            .unwrap_or(0)
    }

    fn lock(&self, op: KvOp, key: &str) -> QueueResult<MutexGuard<'_, State>> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| QueueError::transport("in-memory store lock poisoned"))?;
        state.check(op)?;
        state.evict_expired(key, self.clock.now());
        Ok(state)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|ttl| {
            self.clock.now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500))
        })
    }
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKvStore").finish_non_exhaustive()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> QueueResult<Option<String>> {
        let state = self.lock(KvOp::Get, key)?;
        match state.entries.get(key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(v)) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<()> {
        let expires_at = self.expiry(ttl);
        let mut state = self.lock(KvOp::Set, key)?;
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> QueueResult<bool> {
        let expires_at = self.expiry(ttl);
        let mut state = self.lock(KvOp::SetNx, key)?;
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at,
            },
        );
        Ok(true)
    }

    fn del(&self, key: &str) -> QueueResult<bool> {
        let mut state = self.lock(KvOp::Del, key)?;
        Ok(state.entries.remove(key).is_some())
    }

    fn del_if_eq(&self, key: &str, expected: &str) -> QueueResult<bool> {
        let mut state = self.lock(KvOp::Del, key)?;
        let matches = matches!(
            state.entries.get(key).map(|e| &e.value),
            Some(Value::Str(v)) if v == expected
        );
        if matches {
            state.entries.remove(key);
        }
        Ok(matches)
    }

    fn exists(&self, key: &str) -> QueueResult<bool> {
        let state = self.lock(KvOp::Get, key)?;
        Ok(state.entries.contains_key(key))
    }

    fn rpush(&self, list: &str, value: &str) -> QueueResult<()> {
        let mut state = self.lock(KvOp::ListPush, list)?;
        let entry = state.entries.entry(list.to_string()).or_insert_with(|| Entry {
            value: Value::List(VecDeque::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::List(items) => {
                items.push_back(value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(list)),
        }
    }

    fn lrange(&self, list: &str, limit: usize) -> QueueResult<Vec<String>> {
        let state = self.lock(KvOp::ListRead, list)?;
        match state.entries.get(list).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::List(items)) => Ok(items.iter().take(limit).cloned().collect()),
            Some(_) => Err(wrong_type(list)),
        }
    }

    fn lrem(&self, list: &str, value: &str, count: usize) -> QueueResult<usize> {
        let mut state = self.lock(KvOp::ListRemove, list)?;
        let Some(entry) = state.entries.get_mut(list) else {
            return Ok(0);
        };
        let Value::List(items) = &mut entry.value else {
            return Err(wrong_type(list));
        };

        let mut removed = 0;
        items.retain(|item| {
            if item == value && (count == 0 || removed < count) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if items.is_empty() {
            state.entries.remove(list);
        }
        Ok(removed)
    }

    fn llen(&self, list: &str) -> QueueResult<usize> {
        let state = self.lock(KvOp::ListRead, list)?;
        match state.entries.get(list).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::List(items)) => Ok(items.len()),
            Some(_) => Err(wrong_type(list)),
        }
    }

    fn sadd(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.lock(KvOp::SetAdd, set)?;
        let entry = state.entries.entry(set.to_string()).or_insert_with(|| Entry {
            value: Value::Set(BTreeSet::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Set(members) => Ok(members.insert(member.to_string())),
            _ => Err(wrong_type(set)),
        }
    }

    fn srem(&self, set: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.lock(KvOp::SetRemove, set)?;
        let Some(entry) = state.entries.get_mut(set) else {
            return Ok(false);
        };
        let Value::Set(members) = &mut entry.value else {
            return Err(wrong_type(set));
        };
        let removed = members.remove(member);
        if members.is_empty() {
            state.entries.remove(set);
        }
        Ok(removed)
    }

    fn smembers(&self, set: &str) -> QueueResult<Vec<String>> {
        let state = self.lock(KvOp::SetRead, set)?;
        match state.entries.get(set).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(wrong_type(set)),
        }
    }

    fn scard(&self, set: &str) -> QueueResult<usize> {
        let state = self.lock(KvOp::SetRead, set)?;
        match state.entries.get(set).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Set(members)) => Ok(members.len()),
            Some(_) => Err(wrong_type(set)),
        }
    }

    fn zadd(&self, zset: &str, member: &str, score: i64) -> QueueResult<()> {
        let mut state = self.lock(KvOp::ZAdd, zset)?;
        let entry = state.entries.entry(zset.to_string()).or_insert_with(|| Entry {
            value: Value::ZSet(BTreeMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::ZSet(members) => {
                members.insert(member.to_string(), score);
                Ok(())
            }
            _ => Err(wrong_type(zset)),
        }
    }

    fn zrem(&self, zset: &str, member: &str) -> QueueResult<bool> {
        let mut state = self.lock(KvOp::ZRemove, zset)?;
        let Some(entry) = state.entries.get_mut(zset) else {
            return Ok(false);
        };
        let Value::ZSet(members) = &mut entry.value else {
            return Err(wrong_type(zset));
        };
        let removed = members.remove(member).is_some();
        if members.is_empty() {
            state.entries.remove(zset);
        }
        Ok(removed)
    }

    fn zscore(&self, zset: &str, member: &str) -> QueueResult<Option<i64>> {
        let state = self.lock(KvOp::ZRead, zset)?;
        match state.entries.get(zset).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::ZSet(members)) => Ok(members.get(member).copied()),
            Some(_) => Err(wrong_type(zset)),
        }
    }

    fn zrange_by_score(&self, zset: &str, max: i64, limit: usize) -> QueueResult<Vec<String>> {
        let state = self.lock(KvOp::ZRead, zset)?;
        match state.entries.get(zset).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(members)) => Ok(sorted(members)
                .into_iter()
                .filter(|(_, score)| *score <= max)
                .take(limit)
                .map(|(m, _)| m)
                .collect()),
            Some(_) => Err(wrong_type(zset)),
        }
    }

    fn zrange(&self, zset: &str, offset: usize, limit: usize) -> QueueResult<Vec<String>> {
        let state = self.lock(KvOp::ZRead, zset)?;
        match state.entries.get(zset).map(|e| &e.value) {
            None => Ok(Vec::new()),
            Some(Value::ZSet(members)) => Ok(sorted(members)
                .into_iter()
                .skip(offset)
                .take(limit)
                .map(|(m, _)| m)
                .collect()),
            Some(_) => Err(wrong_type(zset)),
        }
    }

    fn zcard(&self, zset: &str) -> QueueResult<usize> {
        let state = self.lock(KvOp::ZRead, zset)?;
        match state.entries.get(zset).map(|e| &e.value) {
            None => Ok(0),
            Some(Value::ZSet(members)) => Ok(members.len()),
            Some(_) => Err(wrong_type(zset)),
        }
    }
}

/// (score, member) ascending, matching Redis sorted-set order.
fn sorted(members: &BTreeMap<String, i64>) -> Vec<(String, i64)> {
    let mut out: Vec<(String, i64)> = members.iter().map(|(m, s)| (m.clone(), *s)).collect();
    out.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    out
}

#[cfg(test)]
mod tests {
    use trackflow_core::ManualClock;

    use super::*;

    fn store() -> (Arc<ManualClock>, InMemoryKvStore) {
        let clock = Arc::new(ManualClock::starting_now());
        let store = InMemoryKvStore::with_clock(clock.clone());
        (clock, store)
    }

    #[test]
    fn set_nx_respects_existing_keys_until_expiry() {
        let (clock, store) = store();

        assert!(store.set_nx("lock", "a", Some(Duration::from_secs(10))).unwrap());
        assert!(!store.set_nx("lock", "b", Some(Duration::from_secs(10))).unwrap());

        clock.advance(Duration::from_secs(11));
        assert!(!store.exists("lock").unwrap());
        assert!(store.set_nx("lock", "b", Some(Duration::from_secs(10))).unwrap());
        assert_eq!(store.get("lock").unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn del_if_eq_only_deletes_matching_value() {
        let (_, store) = store();
        store.set("k", "owner-1", None).unwrap();

        assert!(!store.del_if_eq("k", "owner-2").unwrap());
        assert!(store.del_if_eq("k", "owner-1").unwrap());
        assert!(store.get("k").unwrap().is_none());
    }

    #[test]
    fn plain_set_clears_previous_ttl() {
        let (clock, store) = store();
        store.set("k", "v1", Some(Duration::from_secs(1))).unwrap();
        store.set("k", "v2", None).unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn list_operations_behave_like_redis() {
        let (_, store) = store();
        for v in ["a", "b", "a", "c"] {
            store.rpush("l", v).unwrap();
        }

        assert_eq!(store.lrange("l", 2).unwrap(), vec!["a", "b"]);
        assert_eq!(store.lrem("l", "a", 1).unwrap(), 1);
        assert_eq!(store.lrange("l", 10).unwrap(), vec!["b", "a", "c"]);
        assert_eq!(store.lrem("l", "zzz", 0).unwrap(), 0);
        assert_eq!(store.llen("l").unwrap(), 3);

        store.lrem("l", "a", 0).unwrap();
        store.lrem("l", "b", 0).unwrap();
        store.lrem("l", "c", 0).unwrap();
        assert!(!store.exists("l").unwrap());
    }

    #[test]
    fn sorted_sets_order_by_score_then_member() {
        let (_, store) = store();
        store.zadd("z", "b", 10).unwrap();
        store.zadd("z", "a", 10).unwrap();
        store.zadd("z", "c", 5).unwrap();

        assert_eq!(store.zrange("z", 0, 10).unwrap(), vec!["c", "a", "b"]);
        assert_eq!(store.zrange("z", 1, 1).unwrap(), vec!["a"]);
        assert!(store.zrange("z", 5, 10).unwrap().is_empty());
        assert_eq!(store.zrange_by_score("z", 9, 10).unwrap(), vec!["c"]);
        assert_eq!(store.zscore("z", "a").unwrap(), Some(10));
        assert!(store.zrem("z", "a").unwrap());
        assert!(!store.zrem("z", "a").unwrap());
        assert_eq!(store.zcard("z").unwrap(), 2);
    }

    #[test]
    fn wrong_type_is_a_transport_error() {
        let (_, store) = store();
        store.set("k", "v", None).unwrap();
        assert!(matches!(store.rpush("k", "x"), Err(QueueError::Transport(_))));
    }

    #[test]
    fn injected_faults_fail_only_that_operation() {
        let (_, store) = store();
        store.inject_fault(KvOp::ListPush);

        assert!(store.set("k", "v", None).is_ok());
        assert!(matches!(store.rpush("l", "x"), Err(QueueError::Transport(_))));

        store.clear_faults();
        assert!(store.rpush("l", "x").is_ok());

        store.set_unavailable(true);
        assert!(matches!(store.get("k"), Err(QueueError::Transport(_))));
    }
}
