pub mod connection;
pub mod registry;

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{
    api::events::{self, ObserverEvent},
    config::Config,
    error::{ServiceError, ServiceResult},
    protocol::{BusEvent, Intent, Medium, ServerEvent, SignalEnvelope},
    queue::{EnqueueOutcome, QueueEngine},
    relay::SignalingRelay,
    room::{Room, RoomRegistry},
    safety::{RateLimit, RateLimiter, SafetyLayer},
    session::{SessionAuthority, fields},
    statistics::{Statistics, StatsSnapshot},
    store::{Store, keys},
};

use self::registry::{ConnectionRegistry, EventTx};

/// Everything a gateway instance needs, built once at startup and threaded
/// into every connection task explicitly.
pub struct GatewayOptions {
    pub store: Arc<dyn Store>,
    pub sessions: SessionAuthority,
    pub queues: QueueEngine,
    pub rooms: RoomRegistry,
    pub relay: SignalingRelay,
    pub safety: SafetyLayer,
    pub limiter: RateLimiter,
    pub statistics: Statistics,
    pub config: Arc<Config>,
    pub shutdown: watch::Receiver<bool>,
}

/// The connection gateway: owns this instance's client connections, binds
/// them to sessions, dispatches their commands and fans events out across
/// instances over the store's pub/sub.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayOptions>,
    registry: ConnectionRegistry,
}

impl Gateway {
    pub fn new(options: GatewayOptions) -> Self {
        Self {
            inner: Arc::new(options),
            registry: ConnectionRegistry::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    pub fn sessions(&self) -> &SessionAuthority {
        &self.inner.sessions
    }

    pub fn safety(&self) -> &SafetyLayer {
        &self.inner.safety
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    pub fn statistics(&self) -> &Statistics {
        &self.inner.statistics
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn shutdown_watch(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.clone()
    }

    /// Deliver an event to a session wherever it is attached.
    pub async fn publish_event(&self, session_id: &str, event: ServerEvent) -> ServiceResult<()> {
        self.inner
            .store
            .publish(
                &keys::user_topic(session_id),
                &BusEvent::Deliver(event).encode(),
            )
            .await?;

        Ok(())
    }

    /// Ask whichever instance holds the session to force it off after the
    /// configured warning delay.
    pub async fn force_disconnect(&self, session_id: &str) -> ServiceResult<()> {
        self.inner
            .store
            .publish(
                &keys::user_topic(session_id),
                &BusEvent::ForceDisconnect {
                    warning_secs: self.inner.config.limits.warning_delay_secs,
                }
                .encode(),
            )
            .await?;

        Ok(())
    }

    /// Bind a freshly authenticated connection to its session.
    pub async fn attach(
        &self,
        session_id: &str,
        connection_id: &str,
        tx: EventTx,
    ) -> ServiceResult<crate::store::Subscription> {
        let subscription = self
            .inner
            .store
            .subscribe(&keys::user_topic(session_id))
            .await?;

        let now = crate::util::now_ms().to_string();
        self.inner
            .store
            .hset(
                &keys::session(session_id),
                &[
                    (fields::SOCKET_ID, connection_id),
                    (fields::LAST_SEEN, now.as_str()),
                ],
                Some(self.inner.sessions.session_ttl()),
            )
            .await?;
        self.inner
            .store
            .set(
                &keys::socket(connection_id),
                session_id,
                Some(Duration::from_secs(3600)),
            )
            .await?;

        self.registry.register(session_id, connection_id, tx);
        self.inner.statistics.connected();
        if let Err(error) = self.inner.statistics.record_connection(&*self.inner.store).await {
            log::warn!("connection counters not updated: {error}");
        }

        log::info!("attached: session={session_id}, connection={connection_id}");
        Ok(subscription)
    }

    /// Unbind a connection.
    ///
    /// Stale-socket rule: only the transport the session currently points
    /// at may tear anything down. A detach from a superseded transport is
    /// a no-op beyond its own socket key.
    pub async fn detach(&self, session_id: &str, connection_id: &str) {
        self.registry.unregister(session_id, connection_id);
        self.inner.statistics.disconnected();

        let result: ServiceResult<()> = async {
            let current = self
                .inner
                .store
                .hget(&keys::session(session_id), fields::SOCKET_ID)
                .await?;

            if current.as_deref() == Some(connection_id) {
                self.handle_leave(session_id).await?;
                self.inner
                    .store
                    .hdel(&keys::session(session_id), &[fields::SOCKET_ID])
                    .await?;
            } else {
                log::debug!(
                    "stale detach ignored: session={session_id}, connection={connection_id}"
                );
            }

            self.inner.store.del(&keys::socket(connection_id)).await?;
            Ok(())
        }
        .await;

        if let Err(error) = result {
            log::warn!("detach incomplete: session={session_id}, {error}");
        }

        log::info!("detached: session={session_id}, connection={connection_id}");
    }

    /// `join-queue`: pair or wait. The caller must not already be paired.
    pub async fn handle_join(
        &self,
        session_id: &str,
        intent: Intent,
        medium: Medium,
        seq: Option<u64>,
    ) -> ServiceResult<ServerEvent> {
        if self.inner.rooms.resolve(session_id).await?.is_some() {
            return Err(ServiceError::Conflict("session already has a room"));
        }

        self.inner.queues.withdraw(session_id).await?;
        match self.inner.queues.enqueue(session_id, intent, medium).await? {
            EnqueueOutcome::Matched { room, peer_id } => {
                self.announce_match(&room, session_id, &peer_id).await?;
                Ok(ServerEvent::Matched {
                    room_id: room.id,
                    peer_id,
                    is_initiator: true,
                    seq,
                })
            }
            EnqueueOutcome::Waiting => Ok(ServerEvent::Waiting { seq }),
        }
    }

    /// `next`: drop the current room, notify and rematch the counterparty,
    /// then re-pair the caller.
    pub async fn handle_next(
        &self,
        session_id: &str,
        intent: Intent,
        medium: Medium,
        seq: Option<u64>,
    ) -> ServiceResult<ServerEvent> {
        self.close_current_room(session_id, ServerEvent::PeerSkipped)
            .await?;
        self.handle_join(session_id, intent, medium, seq).await
    }

    /// `leave`: drop the current room, notify and rematch the counterparty,
    /// withdraw the caller from every queue.
    pub async fn handle_leave(&self, session_id: &str) -> ServiceResult<()> {
        self.close_current_room(session_id, ServerEvent::PeerLeft)
            .await?;
        self.inner.queues.withdraw(session_id).await?;
        Ok(())
    }

    /// `signal`: relay a webrtc control message to the counterparty.
    ///
    /// A signal racing a room teardown loses authorization and is dropped
    /// silently; the client learns what happened from `peer-left` or
    /// `peer-skipped` instead.
    pub async fn handle_signal(
        &self,
        session_id: &str,
        room_id: &str,
        target: &str,
        envelope: SignalEnvelope,
    ) -> ServiceResult<()> {
        if !self
            .inner
            .limiter
            .check(
                &format!("signal:{session_id}"),
                RateLimit::per_second(self.inner.config.limits.signals_per_second),
            )
            .await
        {
            return Err(ServiceError::RateLimited);
        }

        match self
            .inner
            .relay
            .relay(session_id, room_id, target, envelope)
            .await
        {
            Err(ServiceError::NotAuthorized) => Ok(()),
            other => other,
        }
    }

    pub async fn handle_stats(&self) -> ServiceResult<StatsSnapshot> {
        self.inner.statistics.snapshot(&*self.inner.store).await
    }

    /// Destroy the caller's current room, if any, deliver `notice` to the
    /// counterparty first and then try to immediately re-pair it.
    async fn close_current_room(
        &self,
        session_id: &str,
        notice: ServerEvent,
    ) -> ServiceResult<()> {
        let Some(room_id) = self.inner.rooms.resolve(session_id).await? else {
            return Ok(());
        };

        let participants = self.inner.rooms.destroy(&room_id).await?;
        events::emit(ObserverEvent::RoomClosed {
            room_id: room_id.clone(),
            participants: participants.clone(),
        });

        for other in participants.iter().filter(|it| *it != session_id) {
            self.publish_event(other, notice.clone()).await?;

            if let Err(error) = self.rematch(other).await {
                log::warn!("counterparty rematch failed: session={other}, {error}");
            }
        }

        Ok(())
    }

    /// Re-pair an abandoned counterparty with a new peer on its own intent
    /// and medium, or put it back in its queue.
    async fn rematch(&self, session_id: &str) -> ServiceResult<()> {
        let Some(record) = self.inner.sessions.load(session_id).await? else {
            return Ok(());
        };

        let (Some(intent), Some(medium)) = (record.selected_mode, record.connection_type) else {
            return Ok(());
        };

        self.inner.queues.withdraw(session_id).await?;
        match self.inner.queues.enqueue(session_id, intent, medium).await? {
            EnqueueOutcome::Matched { room, peer_id } => {
                self.publish_event(
                    session_id,
                    ServerEvent::Matched {
                        room_id: room.id.clone(),
                        peer_id: peer_id.clone(),
                        is_initiator: true,
                        seq: None,
                    },
                )
                .await?;

                self.announce_match(&room, session_id, &peer_id).await?;
            }
            EnqueueOutcome::Waiting => {}
        }

        Ok(())
    }

    /// Tell the non-initiating side about a fresh room and surface it on
    /// the observer stream.
    async fn announce_match(
        &self,
        room: &Room,
        initiator: &str,
        peer_id: &str,
    ) -> ServiceResult<()> {
        self.publish_event(
            peer_id,
            ServerEvent::Matched {
                room_id: room.id.clone(),
                peer_id: initiator.to_string(),
                is_initiator: false,
                seq: None,
            },
        )
        .await?;

        events::emit(ObserverEvent::Matched {
            room_id: room.id.clone(),
            mode: room.mode,
            connection_type: room.connection_type,
            initiator_id: room.initiator_id.clone(),
        });

        Ok(())
    }
}
