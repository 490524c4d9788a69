use std::sync::Arc;

use crate::{
    config::Config,
    error::{ServiceError, ServiceResult},
    protocol::{BusEvent, ServerEvent, SignalEnvelope},
    room::RoomRegistry,
    store::{Store, keys},
};

/// Forwards typed webrtc control messages between the two participants of a
/// room.
///
/// The relay never looks inside an envelope; it only checks that both ends
/// belong to the room and that the payload is within bounds. Delivery is
/// best-effort, at-most-once, over the target's `user:<session>` topic.
#[derive(Clone)]
pub struct SignalingRelay {
    store: Arc<dyn Store>,
    rooms: RoomRegistry,
    payload_limit: usize,
}

impl SignalingRelay {
    pub fn new(store: Arc<dyn Store>, rooms: RoomRegistry, config: &Config) -> Self {
        Self {
            store,
            rooms,
            payload_limit: config.limits.signal_payload_limit,
        }
    }

    pub async fn relay(
        &self,
        source: &str,
        room_id: &str,
        target: &str,
        envelope: SignalEnvelope,
    ) -> ServiceResult<()> {
        let size = serde_json::to_vec(&envelope.payload)
            .map(|it| it.len())
            .unwrap_or(usize::MAX);
        if size > self.payload_limit {
            return Err(ServiceError::InvalidArgument(format!(
                "signal payload of {size} bytes exceeds the {} byte limit",
                self.payload_limit
            )));
        }

        if source == target
            || !self.rooms.authorize(source, room_id).await?
            || !self.rooms.authorize(target, room_id).await?
        {
            return Err(ServiceError::NotAuthorized);
        }

        self.store
            .publish(
                &keys::user_topic(target),
                &BusEvent::Deliver(ServerEvent::Signal {
                    signal: envelope,
                    from_id: source.to_string(),
                })
                .encode(),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::{Intent, Medium, SignalKind},
        store::memory::MemoryStore,
    };

    async fn relay_fixture() -> (SignalingRelay, RoomRegistry, Arc<dyn Store>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let config = Config::default();
        let rooms = RoomRegistry::new(store.clone(), &config);
        let relay = SignalingRelay::new(store.clone(), rooms.clone(), &config);
        (relay, rooms, store)
    }

    fn envelope(payload: serde_json::Value) -> SignalEnvelope {
        SignalEnvelope {
            kind: SignalKind::Offer,
            payload,
        }
    }

    #[tokio::test]
    async fn delivers_to_target_topic() {
        let (relay, rooms, store) = relay_fixture().await;
        let room = rooms
            .mint("a", "b", Intent::Casual, Medium::Video)
            .await
            .unwrap();

        let mut sub = store.subscribe(&keys::user_topic("b")).await.unwrap();
        relay
            .relay("a", &room.id, "b", envelope(serde_json::json!({"sdp": "x"})))
            .await
            .unwrap();

        let event = BusEvent::decode(&sub.recv().await.unwrap()).unwrap();
        match event {
            BusEvent::Deliver(ServerEvent::Signal { from_id, .. }) => assert_eq!(from_id, "a"),
            other => panic!("unexpected bus event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejects_outsiders() {
        let (relay, rooms, _) = relay_fixture().await;
        let room = rooms
            .mint("a", "b", Intent::Casual, Medium::Video)
            .await
            .unwrap();

        assert!(matches!(
            relay
                .relay("c", &room.id, "b", envelope(serde_json::Value::Null))
                .await,
            Err(ServiceError::NotAuthorized)
        ));

        // A destroyed room drops signals from former participants.
        rooms.destroy(&room.id).await.unwrap();
        assert!(matches!(
            relay
                .relay("a", &room.id, "b", envelope(serde_json::Value::Null))
                .await,
            Err(ServiceError::NotAuthorized)
        ));
    }

    #[tokio::test]
    async fn payload_size_boundary() {
        let (relay, rooms, _) = relay_fixture().await;
        let room = rooms
            .mint("a", "b", Intent::Casual, Medium::Video)
            .await
            .unwrap();

        // A json string serializes to its bytes plus two quotes; exactly
        // 16 KiB passes, one byte more does not.
        let exact = serde_json::Value::String("x".repeat(16 * 1024 - 2));
        relay.relay("a", &room.id, "b", envelope(exact)).await.unwrap();

        let over = serde_json::Value::String("x".repeat(16 * 1024 - 1));
        assert!(matches!(
            relay.relay("a", &room.id, "b", envelope(over)).await,
            Err(ServiceError::InvalidArgument(_))
        ));
    }
}
