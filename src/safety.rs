use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    error::{ServiceError, ServiceResult},
    session::SessionAuthority,
    store::{Op, Store, keys},
    util,
};

const REPORT_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);
const REPORT_COUNTER_TTL: Duration = Duration::from_secs(24 * 3600);
const REPORT_LIST_CAP: i64 = 1000;
const REPORT_PAGE: i64 = 100;

/// One sliding window: at most `limit` acceptances per `window`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub limit: u64,
    pub window: Duration,
}

impl RateLimit {
    pub fn per_second(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(1),
        }
    }

    pub fn per_minute(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(60),
        }
    }

    pub fn per_hour(limit: u64) -> Self {
        Self {
            limit,
            window: Duration::from_secs(3600),
        }
    }
}

/// Sliding-window rate limiter over a sorted set per identifier.
///
/// Scores are timestamps; each check evicts the expired window, counts what
/// is left, and records the attempt in one transaction. When the store is
/// down the limiter fails open: refusing all traffic because a backend
/// blipped is worse than letting a burst through.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn Store>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn check(&self, identifier: &str, limit: RateLimit) -> bool {
        let key = keys::ratelimit(identifier);
        let now = util::now_ms();
        let window_ms = limit.window.as_millis() as u64;
        let member = format!("{now}-{}", util::rand_hex(4));

        let result = self
            .store
            .pipeline(vec![
                Op::ZRemRangeByScore {
                    key: key.clone(),
                    min: 0,
                    max: now.saturating_sub(window_ms),
                },
                Op::ZCard { key: key.clone() },
                Op::ZAdd {
                    key: key.clone(),
                    member,
                    score: now,
                },
                Op::Expire {
                    key,
                    ttl: limit.window,
                },
            ])
            .await;

        match result {
            Ok(replies) => (replies[1].as_int() as u64) < limit.limit,
            Err(error) => {
                log::warn!("rate limiter failing open: identifier={identifier}, {error}");
                true
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub reported_session_id: String,
    pub room_id: String,
    pub reason: String,
    #[serde(default)]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: String,
    pub reporter_id: String,
    pub reported_id: String,
    pub room_id: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub created_at: u64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportOutcome {
    pub report_id: String,
    pub should_auto_disconnect: bool,
}

/// Abuse-report ingestion and the auto-disconnect threshold.
#[derive(Clone)]
pub struct SafetyLayer {
    store: Arc<dyn Store>,
    sessions: SessionAuthority,
    limiter: RateLimiter,
    report_limit: RateLimit,
    auto_disconnect_threshold: u64,
}

impl SafetyLayer {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: SessionAuthority,
        limiter: RateLimiter,
        config: &Config,
    ) -> Self {
        Self {
            store,
            sessions,
            limiter,
            report_limit: RateLimit::per_hour(config.limits.reports_per_hour),
            auto_disconnect_threshold: config.limits.auto_disconnect_threshold,
        }
    }

    /// File a report from `reporter` and bump the target's counter.
    ///
    /// Self-reports are rejected. Crossing the counter threshold flags the
    /// outcome so the gateway can force the target off the service.
    pub async fn file_report(
        &self,
        reporter: &str,
        request: ReportRequest,
    ) -> ServiceResult<ReportOutcome> {
        if request.reported_session_id == reporter {
            return Err(ServiceError::InvalidArgument(
                "cannot report yourself".to_string(),
            ));
        }

        if request.reason.trim().is_empty() {
            return Err(ServiceError::InvalidArgument("missing reason".to_string()));
        }

        if !self
            .limiter
            .check(&format!("report:{reporter}"), self.report_limit)
            .await
        {
            return Err(ServiceError::RateLimited);
        }

        let record = ReportRecord {
            id: uuid::Uuid::new_v4().simple().to_string(),
            reporter_id: reporter.to_string(),
            reported_id: request.reported_session_id.clone(),
            room_id: request.room_id,
            reason: request.reason,
            details: request.details,
            created_at: util::now_ms(),
            status: "pending".to_string(),
        };

        let json = serde_json::to_string(&record)
            .map_err(|it| ServiceError::InvalidArgument(it.to_string()))?;

        self.store
            .set(&keys::report(&record.id), &json, Some(REPORT_RETENTION))
            .await?;
        self.store.rpush(&keys::reports_list(), &json).await?;
        self.store
            .ltrim(&keys::reports_list(), -REPORT_LIST_CAP, -1)
            .await?;

        let count = self
            .store
            .incr_by(
                &keys::reported(&record.reported_id),
                1,
                Some(REPORT_COUNTER_TTL),
            )
            .await?;
        self.sessions.bump_report_count(&record.reported_id).await?;

        let should_auto_disconnect = count.max(0) as u64 >= self.auto_disconnect_threshold;
        log::info!(
            "report filed: id={}, target={}, count={count}, auto_disconnect={should_auto_disconnect}",
            record.id,
            record.reported_id
        );

        Ok(ReportOutcome {
            report_id: record.id,
            should_auto_disconnect,
        })
    }

    /// The most recent reports, newest first, optionally filtered by
    /// status.
    pub async fn recent_reports(&self, status: Option<&str>) -> ServiceResult<Vec<ReportRecord>> {
        let raw = self
            .store
            .lrange(&keys::reports_list(), -REPORT_PAGE, -1)
            .await?;

        let mut reports: Vec<ReportRecord> = raw
            .iter()
            .filter_map(|it| serde_json::from_str(it).ok())
            .filter(|it: &ReportRecord| status.is_none_or(|status| it.status == status))
            .collect();

        reports.reverse();
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn fixture() -> (SafetyLayer, SessionAuthority, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut config = Config::default();
        config.auth.secret = "test-secret".to_string();

        let sessions = SessionAuthority::new(store.clone(), &config);
        let limiter = RateLimiter::new(store.clone());
        let safety = SafetyLayer::new(store.clone(), sessions.clone(), limiter, &config);
        (safety, sessions, store)
    }

    fn request(target: &str) -> ReportRequest {
        ReportRequest {
            reported_session_id: target.to_string(),
            room_id: "room".to_string(),
            reason: "spam".to_string(),
            details: None,
        }
    }

    #[tokio::test]
    async fn rate_limit_window() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store);
        let limit = RateLimit::per_minute(3);

        for _ in 0..3 {
            assert!(limiter.check("id", limit).await);
        }

        assert!(!limiter.check("id", limit).await);
    }

    #[tokio::test]
    async fn self_report_rejected() {
        let (safety, sessions, _) = fixture();
        let me = sessions.issue().await.unwrap().session_id;

        assert!(matches!(
            safety.file_report(&me, request(&me)).await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn threshold_crossing() {
        let (safety, sessions, _) = fixture();
        let target = sessions.issue().await.unwrap().session_id;

        for expected in [false, false, true] {
            let reporter = sessions.issue().await.unwrap().session_id;
            let outcome = safety.file_report(&reporter, request(&target)).await.unwrap();
            assert_eq!(outcome.should_auto_disconnect, expected);
        }

        let record = sessions.load(&target).await.unwrap().unwrap();
        assert_eq!(record.report_count, 3);
    }

    #[tokio::test]
    async fn report_rate_limited() {
        let (safety, sessions, _) = fixture();
        let reporter = sessions.issue().await.unwrap().session_id;

        for index in 0..5 {
            let target = sessions.issue().await.unwrap().session_id;
            assert!(
                safety.file_report(&reporter, request(&target)).await.is_ok(),
                "report {index} should pass"
            );
        }

        let target = sessions.issue().await.unwrap().session_id;
        assert!(matches!(
            safety.file_report(&reporter, request(&target)).await,
            Err(ServiceError::RateLimited)
        ));
    }

    #[tokio::test]
    async fn recent_reports_filter() {
        let (safety, sessions, _) = fixture();
        let reporter = sessions.issue().await.unwrap().session_id;
        let target = sessions.issue().await.unwrap().session_id;

        let outcome = safety.file_report(&reporter, request(&target)).await.unwrap();

        let all = safety.recent_reports(None).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, outcome.report_id);
        assert_eq!(all[0].status, "pending");

        assert!(safety.recent_reports(Some("resolved")).await.unwrap().is_empty());
    }
}
