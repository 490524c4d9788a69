use std::{str::FromStr, sync::Arc, time::Duration};

use crate::{
    config::Config,
    error::{ServiceError, ServiceResult},
    protocol::{Intent, Medium},
    session::fields,
    store::{Op, Store, keys},
    util,
};

mod room_fields {
    pub const PARTICIPANTS: &str = "participants";
    pub const MODE: &str = "mode";
    pub const CONNECTION_TYPE: &str = "connectionType";
    pub const INITIATOR_ID: &str = "initiatorId";
    pub const CREATED_AT: &str = "createdAt";
}

/// The two-participant rendezvous minted at pairing time.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: String,
    pub participants: [String; 2],
    pub mode: Intent,
    pub connection_type: Medium,
    pub initiator_id: String,
    pub created_at: u64,
}

impl Room {
    pub fn other(&self, session_id: &str) -> Option<&str> {
        self.participants
            .iter()
            .find(|it| *it != session_id)
            .map(|it| it.as_str())
    }
}

/// Owns active room records and the session -> room mapping.
///
/// A room record and both reverse mappings are created in one transaction
/// and destroyed in one transaction; a reader that still observes a partial
/// state treats it as destroyed.
#[derive(Clone)]
pub struct RoomRegistry {
    store: Arc<dyn Store>,
    room_ttl: Duration,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn Store>, config: &Config) -> Self {
        Self {
            store,
            room_ttl: Duration::from_secs(config.limits.room_ttl_secs),
        }
    }

    /// Mint a room for (peer, initiator). The initiator is the session that
    /// popped the peer off a queue and is the one producing the webrtc
    /// offer.
    pub async fn mint(
        &self,
        initiator: &str,
        peer: &str,
        mode: Intent,
        connection_type: Medium,
    ) -> ServiceResult<Room> {
        if self.resolve(initiator).await?.is_some() || self.resolve(peer).await?.is_some() {
            return Err(ServiceError::Conflict("session already has a room"));
        }

        let created_at = util::now_ms();
        let id = format!("{}-{}", created_at, util::rand_hex(6));
        let participants = serde_json::to_string(&[peer, initiator])
            .unwrap_or_else(|_| format!("[\"{peer}\",\"{initiator}\"]"));

        self.store
            .pipeline(vec![
                Op::HSet {
                    key: keys::room(&id),
                    fields: vec![
                        (room_fields::PARTICIPANTS.to_string(), participants),
                        (room_fields::MODE.to_string(), mode.to_string()),
                        (
                            room_fields::CONNECTION_TYPE.to_string(),
                            connection_type.to_string(),
                        ),
                        (room_fields::INITIATOR_ID.to_string(), initiator.to_string()),
                        (room_fields::CREATED_AT.to_string(), created_at.to_string()),
                    ],
                },
                Op::Expire {
                    key: keys::room(&id),
                    ttl: self.room_ttl,
                },
                Op::HSet {
                    key: keys::session(initiator),
                    fields: vec![
                        (fields::MATCH_ID.to_string(), id.clone()),
                        (fields::PEER_ID.to_string(), peer.to_string()),
                    ],
                },
                Op::HSet {
                    key: keys::session(peer),
                    fields: vec![
                        (fields::MATCH_ID.to_string(), id.clone()),
                        (fields::PEER_ID.to_string(), initiator.to_string()),
                    ],
                },
            ])
            .await?;

        let _ = self
            .store
            .incr_by(&keys::stats_active_rooms(), 1, None)
            .await;
        let _ = self
            .store
            .hincr_by(&keys::stats_modes(), mode.as_str(), 1)
            .await;

        log::info!("room minted: id={id}, initiator={initiator}, peer={peer}, mode={mode}");

        Ok(Room {
            id,
            participants: [peer.to_string(), initiator.to_string()],
            mode,
            connection_type,
            initiator_id: initiator.to_string(),
            created_at,
        })
    }

    pub async fn lookup(&self, room_id: &str) -> ServiceResult<Option<Room>> {
        let map = self.store.hgetall(&keys::room(room_id)).await?;
        if map.is_empty() {
            return Ok(None);
        }

        let participants: Option<[String; 2]> = map
            .get(room_fields::PARTICIPANTS)
            .and_then(|it| serde_json::from_str(it).ok());
        let mode = map
            .get(room_fields::MODE)
            .and_then(|it| Intent::from_str(it).ok());
        let connection_type = map
            .get(room_fields::CONNECTION_TYPE)
            .and_then(|it| Medium::from_str(it).ok());

        match (participants, mode, connection_type) {
            (Some(participants), Some(mode), Some(connection_type)) => Ok(Some(Room {
                id: room_id.to_string(),
                initiator_id: map
                    .get(room_fields::INITIATOR_ID)
                    .cloned()
                    .unwrap_or_default(),
                created_at: map
                    .get(room_fields::CREATED_AT)
                    .and_then(|it| it.parse().ok())
                    .unwrap_or(0),
                participants,
                mode,
                connection_type,
            })),
            // A torn record is as good as destroyed; finish the job.
            _ => {
                log::warn!("tearing down inconsistent room: id={room_id}");
                self.destroy(room_id).await?;
                Ok(None)
            }
        }
    }

    /// The session's current room id, if any.
    pub async fn resolve(&self, session_id: &str) -> ServiceResult<Option<String>> {
        Ok(self
            .store
            .hget(&keys::session(session_id), fields::MATCH_ID)
            .await?)
    }

    /// True iff the session's current room is exactly `room_id`.
    pub async fn authorize(&self, session_id: &str, room_id: &str) -> ServiceResult<bool> {
        Ok(self.resolve(session_id).await?.as_deref() == Some(room_id))
    }

    /// Destroy the room and both reverse mappings, returning the prior
    /// participants. Destroying a vanished room returns an empty list.
    pub async fn destroy(&self, room_id: &str) -> ServiceResult<Vec<String>> {
        let map = self.store.hgetall(&keys::room(room_id)).await?;
        let participants: Vec<String> = map
            .get(room_fields::PARTICIPANTS)
            .and_then(|it| serde_json::from_str(it).ok())
            .unwrap_or_default();

        let mut ops = vec![Op::Del {
            key: keys::room(room_id),
        }];

        for participant in &participants {
            // Leave a participant's mapping alone if it already points at a
            // newer room.
            if self.resolve(participant).await?.as_deref() == Some(room_id) {
                ops.push(Op::HDel {
                    key: keys::session(participant),
                    fields: vec![fields::MATCH_ID.to_string(), fields::PEER_ID.to_string()],
                });
            }
        }

        self.store.pipeline(ops).await?;

        if !map.is_empty() {
            let _ = self
                .store
                .incr_by(&keys::stats_active_rooms(), -1, None)
                .await;
            log::info!("room destroyed: id={room_id}");
        }

        Ok(participants)
    }
}
