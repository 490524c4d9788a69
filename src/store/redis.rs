use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{Client, FromRedisValue, aio::ConnectionManager};
use tokio::sync::mpsc;

use super::{Op, Reply, Store, StoreError, StoreResult, Subscription};

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

fn unavailable(error: redis::RedisError) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

fn transient(error: &redis::RedisError) -> bool {
    error.is_io_error() || error.is_timeout() || error.is_connection_dropped()
}

enum PubSubCommand {
    Subscribe {
        topic: String,
        id: u64,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    },
    Unsubscribe {
        topic: String,
        id: u64,
    },
}

/// Shared state store backed by a redis server.
///
/// Commands run over a managed multiplexed connection and are retried once
/// with a short backoff on transient transport failure. Pub/sub runs on a
/// dedicated connection owned by a background task that re-subscribes after
/// reconnects.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    pubsub: mpsc::UnboundedSender<PubSubCommand>,
    next_sub: Arc<AtomicU64>,
}

impl RedisStore {
    pub async fn connect(url: &str, pubsub_url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(unavailable)?;
        let conn = ConnectionManager::new(client).await.map_err(unavailable)?;

        let pubsub_client = Client::open(pubsub_url).map_err(unavailable)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pubsub_task(pubsub_client, rx));

        Ok(Self {
            conn,
            pubsub: tx,
            next_sub: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn run<T: FromRedisValue>(&self, cmd: redis::Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        let first: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
        match first {
            Ok(value) => Ok(value),
            Err(error) if transient(&error) => {
                tokio::time::sleep(RETRY_BACKOFF).await;

                let retried: redis::RedisResult<T> = cmd.query_async(&mut conn).await;
                retried.map_err(unavailable)
            }
            Err(error) => Err(unavailable(error)),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }

        self.run(cmd).await
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(key);
        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    async fn incr_by(
        &self,
        key: &str,
        delta: i64,
        ttl_on_create: Option<Duration>,
    ) -> StoreResult<i64> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(key).arg(delta);
        let value: i64 = self.run(cmd).await?;

        // The increment created the key when the counter lands exactly on
        // the delta; only then does the window ttl get stamped.
        if value == delta {
            if let Some(ttl) = ttl_on_create {
                self.expire(key, ttl).await?;
            }
        }

        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(key).arg(ttl.as_millis() as u64);
        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(key).arg(field);
        self.run(cmd).await
    }

    async fn hgetall(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn hset(
        &self,
        key: &str,
        fields: &[(&str, &str)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }

        let _: i64 = self.run(cmd).await?;

        if let Some(ttl) = ttl {
            self.expire(key, ttl).await?;
        }

        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[&str]) -> StoreResult<()> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key);
        for field in fields {
            cmd.arg(field);
        }

        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(key).arg(field).arg(delta);
        self.run(cmd).await
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("LPOP");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn rpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("RPUSH");
        cmd.arg(key).arg(value);
        self.run(cmd).await
    }

    async fn lrem(&self, key: &str, value: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(key).arg(0).arg(value);
        self.run(cmd).await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(key);
        self.run(cmd).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("LRANGE");
        cmd.arg(key).arg(start).arg(stop);
        self.run(cmd).await
    }

    async fn ltrim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        let mut cmd = redis::cmd("LTRIM");
        cmd.arg(key).arg(start).arg(stop);
        self.run(cmd).await
    }

    async fn pipeline(&self, ops: Vec<Op>) -> StoreResult<Vec<Reply>> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                Op::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(key).arg(value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl.as_millis() as u64);
                    }
                }
                Op::Del { key } => {
                    pipe.cmd("DEL").arg(key);
                }
                Op::HSet { key, fields } => {
                    let cmd = pipe.cmd("HSET").arg(key);
                    for (field, value) in fields {
                        cmd.arg(field).arg(value);
                    }
                }
                Op::HDel { key, fields } => {
                    let cmd = pipe.cmd("HDEL").arg(key);
                    for field in fields {
                        cmd.arg(field);
                    }
                }
                Op::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE").arg(key).arg(ttl.as_millis() as u64);
                }
                Op::ZAdd { key, member, score } => {
                    pipe.cmd("ZADD").arg(key).arg(*score).arg(member);
                }
                Op::ZRemRangeByScore { key, min, max } => {
                    pipe.cmd("ZREMRANGEBYSCORE").arg(key).arg(*min).arg(*max);
                }
                Op::ZCard { key } => {
                    pipe.cmd("ZCARD").arg(key);
                }
                Op::LRem { key, value } => {
                    pipe.cmd("LREM").arg(key).arg(0).arg(value);
                }
            }
        }

        let mut conn = self.conn.clone();
        let values: Vec<redis::Value> = match pipe.query_async(&mut conn).await {
            Ok(values) => values,
            Err(error) if transient(&error) => {
                tokio::time::sleep(RETRY_BACKOFF).await;

                let retried: redis::RedisResult<Vec<redis::Value>> =
                    pipe.query_async(&mut conn).await;
                retried.map_err(unavailable)?
            }
            Err(error) => return Err(unavailable(error)),
        };

        Ok(values
            .iter()
            .map(|value| match redis::from_redis_value::<i64>(value) {
                Ok(int) => Reply::Int(int),
                Err(_) => Reply::Unit,
            })
            .collect())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> StoreResult<()> {
        let mut cmd = redis::cmd("PUBLISH");
        cmd.arg(topic).arg(payload);
        let _: i64 = self.run(cmd).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<Subscription> {
        let id = self.next_sub.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        self.pubsub
            .send(PubSubCommand::Subscribe {
                topic: topic.to_string(),
                id,
                tx,
            })
            .map_err(|_| StoreError::Unavailable("pub/sub task is gone".to_string()))?;

        let cmd_tx = self.pubsub.clone();
        let topic = topic.to_string();
        let unsub = Box::new(move || {
            let _ = cmd_tx.send(PubSubCommand::Unsubscribe { topic, id });
        });

        Ok(Subscription::new(rx, Some(unsub)))
    }
}

/// Owns the dedicated pub/sub connection. Subscriptions survive the
/// connection: on transport loss the task reconnects and replays every
/// topic that still has listeners.
async fn pubsub_task(client: Client, mut commands: mpsc::UnboundedReceiver<PubSubCommand>) {
    let mut listeners: AHashMap<String, AHashMap<u64, mpsc::UnboundedSender<Vec<u8>>>> =
        AHashMap::new();

    loop {
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(error) => {
                log::warn!("pub/sub connect failed: {error}");
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };

        let (mut sink, mut stream) = pubsub.split();

        let mut replay_failed = false;
        for topic in listeners.keys() {
            if let Err(error) = sink.subscribe(topic).await {
                log::warn!("pub/sub resubscribe failed: topic={topic}, {error}");
                replay_failed = true;
                break;
            }
        }

        if replay_failed {
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            continue;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(PubSubCommand::Subscribe { topic, id, tx }) => {
                        let fresh = !listeners.contains_key(&topic);
                        listeners.entry(topic.clone()).or_default().insert(id, tx);

                        if fresh {
                            if let Err(error) = sink.subscribe(&topic).await {
                                log::warn!("pub/sub subscribe failed: topic={topic}, {error}");
                                break;
                            }
                        }
                    }
                    Some(PubSubCommand::Unsubscribe { topic, id }) => {
                        let empty = match listeners.get_mut(&topic) {
                            Some(subscribers) => {
                                subscribers.remove(&id);
                                subscribers.is_empty()
                            }
                            None => false,
                        };

                        if empty {
                            listeners.remove(&topic);
                            let _ = sink.unsubscribe(&topic).await;
                        }
                    }
                    // Every store handle is gone; nothing left to serve.
                    None => return,
                },
                message = stream.next() => match message {
                    Some(message) => {
                        let topic = message.get_channel_name().to_string();
                        let payload = message.get_payload_bytes().to_vec();

                        if let Some(subscribers) = listeners.get_mut(&topic) {
                            subscribers.retain(|_, tx| tx.send(payload.clone()).is_ok());
                            if subscribers.is_empty() {
                                listeners.remove(&topic);
                            }
                        }
                    }
                    None => {
                        log::warn!("pub/sub connection lost, reconnecting");
                        break;
                    }
                },
            }
        }

        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}
