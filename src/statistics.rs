use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::ServiceResult,
    protocol::{Intent, Medium},
    store::{Store, keys},
    util,
};

const SNAPSHOT_CACHE: Duration = Duration::from_secs(5);

/// Aggregate counters reported by `/api/stats` and the `stats` event.
///
/// Values are approximate: the online gauge is process-local and the shared
/// counters are best-effort, none of this is a synchronization substrate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub online: u64,
    pub total_connections: u64,
    pub today_connections: u64,
    pub by_mode: HashMap<String, u64>,
    pub realtime: RealtimeStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeStats {
    pub active_rooms: u64,
    pub waiting_by_mode: HashMap<String, u64>,
    pub total_waiting: u64,
}

/// Instance statistics: a process-local online gauge plus a short-lived
/// cache over the shared aggregate counters.
#[derive(Clone, Default)]
pub struct Statistics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    online: AtomicUsize,
    cache: Mutex<Option<(Instant, StatsSnapshot)>>,
}

impl Statistics {
    pub fn connected(&self) {
        self.inner.online.fetch_add(1, Ordering::Relaxed);
    }

    pub fn disconnected(&self) {
        let _ = self
            .inner
            .online
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |it| {
                Some(it.saturating_sub(1))
            });
    }

    pub fn online(&self) -> usize {
        self.inner.online.load(Ordering::Relaxed)
    }

    /// Record one accepted connection in the shared counters.
    pub async fn record_connection(&self, store: &dyn Store) -> ServiceResult<()> {
        store
            .incr_by(&keys::stats_total_connections(), 1, None)
            .await?;
        store
            .incr_by(
                &keys::stats_day(util::day_index()),
                1,
                Some(Duration::from_secs(48 * 3600)),
            )
            .await?;

        Ok(())
    }

    /// Assemble the aggregate snapshot, serving a cached copy for a few
    /// seconds so a chatty `get-stats` client cannot hammer the store.
    pub async fn snapshot(&self, store: &dyn Store) -> ServiceResult<StatsSnapshot> {
        if let Some((at, cached)) = self.inner.cache.lock().as_ref() {
            if at.elapsed() < SNAPSHOT_CACHE {
                let mut cached = cached.clone();
                cached.online = self.online() as u64;
                return Ok(cached);
            }
        }

        let total_connections = read_counter(store, &keys::stats_total_connections()).await?;
        let today_connections = read_counter(store, &keys::stats_day(util::day_index())).await?;

        let by_mode = store
            .hgetall(&keys::stats_modes())
            .await?
            .into_iter()
            .map(|(mode, count)| (mode, count.parse::<u64>().unwrap_or(0)))
            .collect();

        let active_rooms = read_counter(store, &keys::stats_active_rooms())
            .await?
            .max(0);

        let mut waiting_by_mode = HashMap::new();
        let mut total_waiting = 0;
        for intent in Intent::ALL {
            for medium in Medium::ALL {
                let count = store.llen(&keys::queue(intent, medium)).await?;
                total_waiting += count;
                waiting_by_mode.insert(format!("{intent}:{medium}"), count);
            }
        }

        let snapshot = StatsSnapshot {
            online: self.online() as u64,
            total_connections,
            today_connections,
            by_mode,
            realtime: RealtimeStats {
                active_rooms,
                waiting_by_mode,
                total_waiting,
            },
        };

        *self.inner.cache.lock() = Some((Instant::now(), snapshot.clone()));
        Ok(snapshot)
    }
}

async fn read_counter(store: &dyn Store, key: &str) -> ServiceResult<u64> {
    Ok(store
        .get(key)
        .await?
        .and_then(|it| it.parse::<i64>().ok())
        .unwrap_or(0)
        .max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn online_gauge_never_underflows() {
        let statistics = Statistics::default();

        statistics.disconnected();
        assert_eq!(statistics.online(), 0);

        statistics.connected();
        statistics.connected();
        statistics.disconnected();
        assert_eq!(statistics.online(), 1);
    }

    #[tokio::test]
    async fn snapshot_reads_counters() {
        let statistics = Statistics::default();
        let store = MemoryStore::new();

        statistics.record_connection(&store).await.unwrap();
        statistics.record_connection(&store).await.unwrap();

        let snapshot = statistics.snapshot(&store).await.unwrap();
        assert_eq!(snapshot.total_connections, 2);
        assert_eq!(snapshot.today_connections, 2);
        assert_eq!(snapshot.realtime.total_waiting, 0);
    }
}
