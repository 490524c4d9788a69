pub mod memory;
pub mod redis;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::Config;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("malformed value at {key}: {reason}")]
    Malformed { key: String, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One step of a transactional pipeline. Every op maps to exactly one store
/// command so replies line up with ops by index.
#[derive(Debug, Clone)]
pub enum Op {
    Set {
        key: String,
        value: String,
        ttl: Option<Duration>,
    },
    Del {
        key: String,
    },
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    Expire {
        key: String,
        ttl: Duration,
    },
    ZAdd {
        key: String,
        member: String,
        score: u64,
    },
    ZRemRangeByScore {
        key: String,
        min: u64,
        max: u64,
    },
    ZCard {
        key: String,
    },
    LRem {
        key: String,
        value: String,
    },
}

/// Reply to a single pipeline op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Unit,
    Int(i64),
}

impl Reply {
    pub fn as_int(&self) -> i64 {
        match self {
            Reply::Int(value) => *value,
            Reply::Unit => 0,
        }
    }
}

/// A live subscription to a pub/sub topic. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    unsub: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<Vec<u8>>,
        unsub: Option<Box<dyn FnOnce() + Send>>,
    ) -> Self {
        Self { rx, unsub }
    }

    /// The next message published on the topic, or `None` once the backend
    /// is gone.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsub) = self.unsub.take() {
            unsub();
        }
    }
}

/// Uniform key-value + hash + list + sorted-set + pub/sub abstraction the
/// service runs on, so multiple instances cooperate through one shared
/// backend.
///
/// Every operation can fail; callers treat failures as "unknown outcome"
/// and fail closed, except the rate limiter which fails open.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    /// Atomic counter increment. `ttl_on_create` applies only when the
    /// increment created the key, so an existing window is never extended.
    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> StoreResult<i64>;

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>>;

    async fn hset(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    async fn hdel(&self, key: &str, fields: &[&str]) -> StoreResult<()>;

    /// Atomic per-field increment, returns the new value.
    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Atomic left pop. Exactly one caller observes each element.
    async fn lpop(&self, key: &str) -> StoreResult<Option<String>>;

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Remove every occurrence of `value`, returns how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()>;

    /// Run `ops` as one atomic transaction, replies in op order.
    async fn pipeline(&self, ops: Vec<Op>) -> StoreResult<Vec<Reply>>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> StoreResult<()>;

    async fn subscribe(&self, topic: &str) -> StoreResult<Subscription>;
}

/// Connect the configured backend: `memory://` for the in-process store,
/// anything else is handed to the redis client.
pub async fn connect(config: &Config) -> StoreResult<Arc<dyn Store>> {
    if config.store.url.starts_with("memory://") {
        Ok(Arc::new(memory::MemoryStore::new()))
    } else {
        Ok(Arc::new(
            redis::RedisStore::connect(&config.store.url, config.store.pubsub()).await?,
        ))
    }
}

/// Layout of the keys the service persists in the shared store.
pub mod keys {
    use crate::protocol::{Intent, Medium};

    /// `session:<sessionId>` - hash, ttl 24h.
    pub fn session(id: &str) -> String {
        format!("session:{id}")
    }

    /// `socket:<socketId>` - string = sessionId, ttl 1h.
    pub fn socket(id: &str) -> String {
        format!("socket:{id}")
    }

    /// `queue:<mode>:<medium>` - list of sessionId.
    pub fn queue(intent: Intent, medium: Medium) -> String {
        format!("queue:{intent}:{medium}")
    }

    /// `match:<matchId>` - hash, ttl 1h.
    pub fn room(id: &str) -> String {
        format!("match:{id}")
    }

    /// `ratelimit:<identifier>` - sorted set, scores are timestamps.
    pub fn ratelimit(id: &str) -> String {
        format!("ratelimit:{id}")
    }

    /// `report:<id>` - individual record, ttl 7d.
    pub fn report(id: &str) -> String {
        format!("report:{id}")
    }

    /// `reports:list` - list of json report records.
    pub fn reports_list() -> String {
        "reports:list".to_string()
    }

    /// `reported:<sessionId>` - counter, ttl 24h.
    pub fn reported(id: &str) -> String {
        format!("reported:{id}")
    }

    /// `user:<sessionId>` - pub/sub topic for cross-instance delivery.
    pub fn user_topic(id: &str) -> String {
        format!("user:{id}")
    }

    pub fn stats_total_connections() -> String {
        "stats:total-connections".to_string()
    }

    pub fn stats_day(day: u64) -> String {
        format!("stats:day:{day}")
    }

    pub fn stats_modes() -> String {
        "stats:modes".to_string()
    }

    pub fn stats_active_rooms() -> String {
        "stats:active-rooms".to_string()
    }
}
