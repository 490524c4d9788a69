use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::protocol::ServerEvent;

/// Frames pushed to a connection task's outbound channel.
#[derive(Debug)]
pub enum OutboundFrame {
    Event(ServerEvent),
    Close,
}

/// Outbound sender half of one connection.
#[derive(Clone)]
pub struct EventTx(mpsc::UnboundedSender<OutboundFrame>);

impl EventTx {
    pub fn new(tx: mpsc::UnboundedSender<OutboundFrame>) -> Self {
        Self(tx)
    }

    pub fn event(&self, event: ServerEvent) -> bool {
        self.0.send(OutboundFrame::Event(event)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.0.send(OutboundFrame::Close);
    }
}

struct Registered {
    connection_id: String,
    tx: EventTx,
}

/// The set of connections this instance owns, keyed by session.
///
/// A session has at most one live connection here; registering a newer one
/// closes the older, and unregistering checks the connection id so a late
/// detach from a superseded transport cannot evict its successor.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<AHashMap<String, Registered>>>,
}

impl ConnectionRegistry {
    pub fn register(&self, session_id: &str, connection_id: &str, tx: EventTx) {
        let previous = self.sessions.write().insert(
            session_id.to_string(),
            Registered {
                connection_id: connection_id.to_string(),
                tx,
            },
        );

        if let Some(previous) = previous {
            log::info!(
                "connection replaced: session={session_id}, old={}",
                previous.connection_id
            );
            previous.tx.close();
        }
    }

    /// Remove the binding, but only if it still belongs to `connection_id`.
    pub fn unregister(&self, session_id: &str, connection_id: &str) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get(session_id) {
            Some(registered) if registered.connection_id == connection_id => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    /// Tell every attached client the instance is going away.
    pub fn broadcast_shutdown(&self) {
        for registered in self.sessions.read().values() {
            registered.tx.event(ServerEvent::ShuttingDown);
            registered.tx.close();
        }
    }
}
