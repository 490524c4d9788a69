use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use ahash::AHashMap;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Op, Reply, Store, StoreResult, Subscription};

struct Expiring<T> {
    value: T,
    deadline: Option<Instant>,
}

impl<T> Expiring<T> {
    fn new(value: T, ttl: Option<Duration>) -> Self {
        Self {
            value,
            deadline: ttl.map(|it| Instant::now() + it),
        }
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|it| it <= Instant::now())
    }
}

#[derive(Default)]
struct Tables {
    strings: AHashMap<String, Expiring<String>>,
    hashes: AHashMap<String, Expiring<AHashMap<String, String>>>,
    lists: AHashMap<String, Expiring<VecDeque<String>>>,
    zsets: AHashMap<String, Expiring<Vec<(u64, String)>>>,
}

macro_rules! live {
    ($table:expr, $key:expr) => {{
        if $table.get($key).is_some_and(|it| it.expired()) {
            $table.remove($key);
        }

        $table.get_mut($key)
    }};
}

impl Tables {
    fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) {
        self.strings
            .insert(key.to_string(), Expiring::new(value.to_string(), ttl));
    }

    fn get(&mut self, key: &str) -> Option<String> {
        live!(self.strings, key).map(|it| it.value.clone())
    }

    fn del(&mut self, key: &str) {
        self.strings.remove(key);
        self.hashes.remove(key);
        self.lists.remove(key);
        self.zsets.remove(key);
    }

    fn incr_by(&mut self, key: &str, delta: i64, ttl_on_create: Option<Duration>) -> i64 {
        match live!(self.strings, key) {
            Some(entry) => {
                let value = entry.value.parse::<i64>().unwrap_or(0) + delta;
                entry.value = value.to_string();
                value
            }
            None => {
                self.strings
                    .insert(key.to_string(), Expiring::new(delta.to_string(), ttl_on_create));
                delta
            }
        }
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        let deadline = Some(Instant::now() + ttl);
        if let Some(entry) = live!(self.strings, key) {
            entry.deadline = deadline;
        }
        if let Some(entry) = live!(self.hashes, key) {
            entry.deadline = deadline;
        }
        if let Some(entry) = live!(self.lists, key) {
            entry.deadline = deadline;
        }
        if let Some(entry) = live!(self.zsets, key) {
            entry.deadline = deadline;
        }
    }

    fn hash_entry(&mut self, key: &str) -> &mut Expiring<AHashMap<String, String>> {
        let entry = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(AHashMap::new(), None));

        if entry.expired() {
            entry.value.clear();
            entry.deadline = None;
        }

        entry
    }

    fn hset(&mut self, key: &str, fields: &[(String, String)], ttl: Option<Duration>) {
        let entry = self.hash_entry(key);
        for (field, value) in fields {
            entry.value.insert(field.clone(), value.clone());
        }

        if let Some(ttl) = ttl {
            entry.deadline = Some(Instant::now() + ttl);
        }
    }

    fn hdel(&mut self, key: &str, fields: &[String]) {
        if let Some(entry) = live!(self.hashes, key) {
            for field in fields {
                entry.value.remove(field);
            }
        }
    }

    fn hincr_by(&mut self, key: &str, field: &str, delta: i64) -> i64 {
        let entry = self.hash_entry(key);
        let value = entry
            .value
            .get(field)
            .and_then(|it| it.parse::<i64>().ok())
            .unwrap_or(0)
            + delta;

        entry.value.insert(field.to_string(), value.to_string());
        value
    }

    fn lpop(&mut self, key: &str) -> Option<String> {
        live!(self.lists, key).and_then(|it| it.value.pop_front())
    }

    fn rpush(&mut self, key: &str, value: &str) -> u64 {
        let entry = self
            .lists
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(VecDeque::new(), None));

        if entry.expired() {
            entry.value.clear();
            entry.deadline = None;
        }

        entry.value.push_back(value.to_string());
        entry.value.len() as u64
    }

    fn lrem(&mut self, key: &str, value: &str) -> u64 {
        match live!(self.lists, key) {
            Some(entry) => {
                let before = entry.value.len();
                entry.value.retain(|it| it != value);
                (before - entry.value.len()) as u64
            }
            None => 0,
        }
    }

    fn llen(&mut self, key: &str) -> u64 {
        live!(self.lists, key).map(|it| it.value.len() as u64).unwrap_or(0)
    }

    fn lrange(&mut self, key: &str, start: i64, stop: i64) -> Vec<String> {
        match live!(self.lists, key) {
            Some(entry) => {
                let len = entry.value.len() as i64;
                let from = clamp_index(start, len);
                let to = clamp_index(stop, len);
                if from > to {
                    return Vec::new();
                }

                entry
                    .value
                    .iter()
                    .skip(from as usize)
                    .take((to - from + 1) as usize)
                    .cloned()
                    .collect()
            }
            None => Vec::new(),
        }
    }

    fn ltrim(&mut self, key: &str, start: i64, stop: i64) {
        if let Some(entry) = live!(self.lists, key) {
            let len = entry.value.len() as i64;
            let from = clamp_index(start, len);
            let to = clamp_index(stop, len);
            if from > to {
                entry.value.clear();
                return;
            }

            entry.value = entry
                .value
                .iter()
                .skip(from as usize)
                .take((to - from + 1) as usize)
                .cloned()
                .collect();
        }
    }

    fn zadd(&mut self, key: &str, member: &str, score: u64) {
        let entry = self
            .zsets
            .entry(key.to_string())
            .or_insert_with(|| Expiring::new(Vec::new(), None));

        if entry.expired() {
            entry.value.clear();
            entry.deadline = None;
        }

        entry.value.retain(|(_, it)| it != member);
        entry.value.push((score, member.to_string()));
    }

    fn zremrangebyscore(&mut self, key: &str, min: u64, max: u64) -> u64 {
        match live!(self.zsets, key) {
            Some(entry) => {
                let before = entry.value.len();
                entry.value.retain(|(score, _)| *score < min || *score > max);
                (before - entry.value.len()) as u64
            }
            None => 0,
        }
    }

    fn zcard(&mut self, key: &str) -> u64 {
        live!(self.zsets, key).map(|it| it.value.len() as u64).unwrap_or(0)
    }

    fn apply(&mut self, op: &Op) -> Reply {
        match op {
            Op::Set { key, value, ttl } => {
                self.set(key, value, *ttl);
                Reply::Unit
            }
            Op::Del { key } => {
                self.del(key);
                Reply::Unit
            }
            Op::HSet { key, fields } => {
                self.hset(key, fields, None);
                Reply::Unit
            }
            Op::HDel { key, fields } => {
                self.hdel(key, fields);
                Reply::Unit
            }
            Op::Expire { key, ttl } => {
                self.expire(key, *ttl);
                Reply::Unit
            }
            Op::ZAdd { key, member, score } => {
                self.zadd(key, member, *score);
                Reply::Int(1)
            }
            Op::ZRemRangeByScore { key, min, max } => {
                Reply::Int(self.zremrangebyscore(key, *min, *max) as i64)
            }
            Op::ZCard { key } => Reply::Int(self.zcard(key) as i64),
            Op::LRem { key, value } => Reply::Int(self.lrem(key, value) as i64),
        }
    }
}

fn clamp_index(index: i64, len: i64) -> i64 {
    let index = if index < 0 { len + index } else { index };
    index.clamp(0, (len - 1).max(0))
}

struct Inner {
    tables: Mutex<Tables>,
    topics: Mutex<AHashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<u8>>)>>>,
    next_sub: AtomicU64,
}

/// In-process store backend with the same semantics as the redis one.
///
/// Single-node only. Used by tests and by `memory://` deployments where a
/// shared backend is not worth running.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tables: Mutex::new(Tables::default()),
                topics: Mutex::new(AHashMap::new()),
                next_sub: AtomicU64::new(0),
            }),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.tables.lock().get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.inner.tables.lock().set(key, value, ttl);
        Ok(())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.inner.tables.lock().del(key);
        Ok(())
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> StoreResult<i64> {
        Ok(self.inner.tables.lock().incr_by(key, delta, ttl_on_create))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.tables.lock().expire(key, ttl);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut tables = self.inner.tables.lock();
        Ok(live!(tables.hashes, key).and_then(|it| it.value.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut tables = self.inner.tables.lock();
        Ok(live!(tables.hashes, key)
            .map(|it| it.value.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let fields: Vec<(String, String)> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        self.inner.tables.lock().hset(key, &fields, ttl);
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> StoreResult<()> {
        let fields: Vec<String> = fields.iter().map(|it| it.to_string()).collect();
        self.inner.tables.lock().hdel(key, &fields);
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        Ok(self.inner.tables.lock().hincr_by(key, field, delta))
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.inner.tables.lock().lpop(key))
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        Ok(self.inner.tables.lock().rpush(key, value))
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        Ok(self.inner.tables.lock().lrem(key, value))
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        Ok(self.inner.tables.lock().llen(key))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        Ok(self.inner.tables.lock().lrange(key, start, stop))
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        self.inner.tables.lock().ltrim(key, start, stop);
        Ok(())
    }

    async fn pipeline(&self, ops: Vec<Op>) -> StoreResult<Vec<Reply>> {
        let mut tables = self.inner.tables.lock();
        Ok(ops.iter().map(|op| tables.apply(op)).collect())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> StoreResult<()> {
        let mut topics = self.inner.topics.lock();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|(_, tx)| tx.send(payload.to_vec()).is_ok());
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }

        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<Subscription> {
        let id = self.inner.next_sub.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push((id, tx));

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let topic = topic.to_string();
        let unsub = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut topics = inner.topics.lock();
                if let Some(subscribers) = topics.get_mut(&topic) {
                    subscribers.retain(|(sub_id, _)| *sub_id != id);
                    if subscribers.is_empty() {
                        topics.remove(&topic);
                    }
                }
            }
        });

        Ok(Subscription::new(rx, Some(unsub)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn string_ttl() {
        let store = MemoryStore::new();

        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_fifo() {
        let store = MemoryStore::new();

        store.rpush("q", "a").await.unwrap();
        store.rpush("q", "b").await.unwrap();
        store.rpush("q", "c").await.unwrap();

        assert_eq!(store.llen("q").await.unwrap(), 3);
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.lrem("q", "c").await.unwrap(), 1);
        assert_eq!(store.lpop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.lpop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn hash_fields() {
        let store = MemoryStore::new();

        store
            .hset("h", &[("a", "1"), ("b", "2")], None)
            .await
            .unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap().as_deref(), Some("1"));

        assert_eq!(store.hincr_by("h", "count", 1).await.unwrap(), 1);
        assert_eq!(store.hincr_by("h", "count", 1).await.unwrap(), 2);

        store.hdel("h", &["a"]).await.unwrap();
        assert_eq!(store.hget("h", "a").await.unwrap(), None);
        assert_eq!(store.hgetall("h").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn pipeline_zset_window() {
        let store = MemoryStore::new();

        let replies = store
            .pipeline(vec![
                Op::ZRemRangeByScore {
                    key: "w".to_string(),
                    min: 0,
                    max: 100,
                },
                Op::ZCard { key: "w".to_string() },
                Op::ZAdd {
                    key: "w".to_string(),
                    member: "m1".to_string(),
                    score: 200,
                },
                Op::ZCard { key: "w".to_string() },
            ])
            .await
            .unwrap();

        assert_eq!(replies[1], Reply::Int(0));
        assert_eq!(replies[3], Reply::Int(1));
    }

    #[tokio::test]
    async fn pubsub_fan_out() {
        let store = MemoryStore::new();

        let mut first = store.subscribe("t").await.unwrap();
        let mut second = store.subscribe("t").await.unwrap();

        store.publish("t", b"hello").await.unwrap();
        assert_eq!(first.recv().await.unwrap(), b"hello");
        assert_eq!(second.recv().await.unwrap(), b"hello");

        drop(second);
        store.publish("t", b"again").await.unwrap();
        assert_eq!(first.recv().await.unwrap(), b"again");
    }
}
