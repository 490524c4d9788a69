use std::sync::Arc;

use crate::{
    config::Config,
    error::{ServiceError, ServiceResult},
    protocol::{Intent, Medium},
    room::{Room, RoomRegistry},
    session::{SessionAuthority, fields},
    store::{Store, keys},
    util,
};

/// Result of an enqueue attempt.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A live peer was claimed from the complementary queue; the caller is
    /// the initiator of the minted room.
    Matched { room: Room, peer_id: String },
    /// No admissible peer; the caller was appended to its own queue.
    Waiting,
}

/// Per-(intent, medium) FIFO waiting sets with atomic pairing.
///
/// Pairing claims candidates with a single atomic left-pop: whoever pops an
/// entry owns it, so two instances can never mint a room around the same
/// candidate. Stale entries are discarded on pop.
#[derive(Clone)]
pub struct QueueEngine {
    store: Arc<dyn Store>,
    sessions: SessionAuthority,
    rooms: RoomRegistry,
    scan_limit: usize,
    liveness_window_ms: u64,
}

impl QueueEngine {
    pub fn new(
        store: Arc<dyn Store>,
        sessions: SessionAuthority,
        rooms: RoomRegistry,
        config: &Config,
    ) -> Self {
        Self {
            store,
            sessions,
            rooms,
            scan_limit: config.limits.pair_scan_limit,
            liveness_window_ms: config.limits.liveness_window_secs * 1000,
        }
    }

    /// Try to pair, otherwise join the waiting set.
    ///
    /// The caller must not be present in any queue; the gateway withdraws
    /// on every transition before calling this.
    pub async fn enqueue(
        &self,
        session_id: &str,
        intent: Intent,
        medium: Medium,
    ) -> ServiceResult<EnqueueOutcome> {
        if let Some(room) = self.pair(session_id, intent, medium).await? {
            let peer_id = room.other(session_id).unwrap_or_default().to_string();
            return Ok(EnqueueOutcome::Matched { room, peer_id });
        }

        self.store
            .rpush(&keys::queue(intent, medium), session_id)
            .await?;
        self.store
            .hset(
                &keys::session(session_id),
                &[
                    (fields::SELECTED_MODE, intent.as_str()),
                    (fields::CONNECTION_TYPE, medium.as_str()),
                    (fields::IN_QUEUE, "1"),
                ],
                None,
            )
            .await?;

        log::info!("waiting: session={session_id}, mode={intent}, medium={medium}");
        Ok(EnqueueOutcome::Waiting)
    }

    /// Scan the complementary queue for a live candidate and mint a room
    /// with the caller as initiator.
    ///
    /// Each iteration pops one entry atomically. A candidate is admitted if
    /// it is not the caller, its session record exists, it was seen within
    /// the liveness window, and it has no room; anything else is dropped and
    /// the scan continues, bounded so a queue full of stale entries cannot
    /// spin the instance.
    pub async fn pair(
        &self,
        session_id: &str,
        intent: Intent,
        medium: Medium,
    ) -> ServiceResult<Option<Room>> {
        let target = keys::queue(intent.target(), medium);
        let now = util::now_ms();

        for _ in 0..self.scan_limit {
            let Some(candidate) = self.store.lpop(&target).await? else {
                return Ok(None);
            };

            if candidate == session_id {
                continue;
            }

            let Some(record) = self.sessions.load(&candidate).await? else {
                log::debug!("dropping vanished queue entry: session={candidate}");
                continue;
            };

            if now.saturating_sub(record.last_seen) > self.liveness_window_ms {
                log::debug!("dropping stale queue entry: session={candidate}");
                continue;
            }

            if record.match_id.is_some() {
                continue;
            }

            match self.rooms.mint(session_id, &candidate, intent, medium).await {
                Ok(room) => {
                    self.store
                        .hset(
                            &keys::session(session_id),
                            &[
                                (fields::SELECTED_MODE, intent.as_str()),
                                (fields::CONNECTION_TYPE, medium.as_str()),
                                (fields::IN_QUEUE, "0"),
                            ],
                            None,
                        )
                        .await?;
                    self.store
                        .hset(&keys::session(&candidate), &[(fields::IN_QUEUE, "0")], None)
                        .await?;

                    return Ok(Some(room));
                }
                // The candidate acquired a room between the pop and the
                // claim; it is already out of the queue, keep scanning.
                Err(ServiceError::Conflict(_)) => continue,
                Err(error) => return Err(error),
            }
        }

        Ok(None)
    }

    /// Remove the session from every waiting set. Idempotent, tolerates
    /// duplicate entries.
    pub async fn withdraw(&self, session_id: &str) -> ServiceResult<()> {
        for intent in Intent::ALL {
            for medium in Medium::ALL {
                self.store
                    .lrem(&keys::queue(intent, medium), session_id)
                    .await?;
            }
        }

        self.store
            .hset(&keys::session(session_id), &[(fields::IN_QUEUE, "0")], None)
            .await?;

        Ok(())
    }
}
