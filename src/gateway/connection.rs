use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use tokio::time::{Instant, interval, timeout};

use crate::{
    error::{ServiceError, ServiceResult},
    protocol::{BusEvent, ClientCommand, ServerEvent},
    safety::RateLimit,
    store::Subscription,
};

use super::{
    Gateway,
    registry::{EventTx, OutboundFrame},
};

/// Per-connection protocol state. Most of the session's real state lives in
/// the shared store; this only gates what a transport may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Unauthenticated,
    /// Authenticated and attached, no room and no queue entry.
    Idle,
    Queued,
    Paired,
    TearingDown,
}

/// One long-lived client connection bound to a session.
pub struct Connection {
    gateway: Gateway,
    session_id: String,
    connection_id: String,
    phase: Phase,
    sink: SplitSink<WebSocket, Message>,
}

impl Connection {
    /// Accept a socket: run the auth handshake, attach, then pump frames
    /// until the transport dies, the instance shuts down, or the session is
    /// forced off.
    pub async fn launch(socket: WebSocket, gateway: Gateway) {
        let (sink, mut stream) = socket.split();
        let mut connection = Self {
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            session_id: String::new(),
            phase: Phase::Unauthenticated,
            gateway,
            sink,
        };

        let auth_window =
            Duration::from_secs(connection.gateway.config().limits.auth_timeout_secs);
        match timeout(auth_window, connection.handshake(&mut stream)).await {
            Ok(Ok(session_id)) => connection.session_id = session_id,
            Ok(Err(error)) => {
                let _ = connection
                    .emit(ServerEvent::AuthError {
                        message: error.to_string(),
                    })
                    .await;
                let _ = connection.sink.close().await;
                return;
            }
            Err(_) => {
                let _ = connection
                    .emit(ServerEvent::AuthError {
                        message: "authentication timed out".to_string(),
                    })
                    .await;
                let _ = connection.sink.close().await;
                return;
            }
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let bus = match connection
            .gateway
            .clone()
            .attach(
                &connection.session_id,
                &connection.connection_id,
                EventTx::new(tx),
            )
            .await
        {
            Ok(bus) => bus,
            Err(error) => {
                log::error!(
                    "attach failed: session={}, {error}",
                    connection.session_id
                );
                let _ = connection.sink.close().await;
                return;
            }
        };

        connection.phase = Phase::Idle;
        let _ = connection
            .emit(ServerEvent::AuthOk {
                session_id: connection.session_id.clone(),
            })
            .await;

        connection.poll(stream, rx, bus).await;

        let gateway = connection.gateway.clone();
        gateway
            .detach(&connection.session_id, &connection.connection_id)
            .await;
    }

    /// First frame must be `auth{token}`.
    async fn handshake(&mut self, stream: &mut SplitStream<WebSocket>) -> ServiceResult<String> {
        use crate::error::AuthFailureKind;

        while let Some(Ok(message)) = stream.next().await {
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            return match serde_json::from_str::<ClientCommand>(text.as_str()) {
                Ok(ClientCommand::Auth { token }) => {
                    self.gateway.sessions().authenticate(&token).await
                }
                _ => Err(ServiceError::AuthFailure(AuthFailureKind::MissingToken)),
            };
        }

        Err(ServiceError::AuthFailure(AuthFailureKind::MissingToken))
    }

    /// The connection main loop: client frames, locally queued events,
    /// cross-instance bus events, the idle clock and instance shutdown all
    /// interleave here.
    async fn poll(
        &mut self,
        mut stream: SplitStream<WebSocket>,
        mut outbound: tokio::sync::mpsc::UnboundedReceiver<OutboundFrame>,
        mut bus: Subscription,
    ) {
        let limits = {
            let config = self.gateway.config();
            (
                Duration::from_secs(config.limits.idle_timeout_secs),
                RateLimit::per_second(config.limits.commands_per_second),
            )
        };
        let (idle_timeout, command_limit) = limits;

        let mut shutdown = self.gateway.shutdown_watch();
        let mut ticker = interval(Duration::from_secs(1));
        let mut last_activity = Instant::now();
        let mut force_leave_at: Option<Instant> = None;

        loop {
            tokio::select! {
                frame = outbound.recv() => match frame {
                    Some(OutboundFrame::Event(event)) => {
                        if self.emit(event).await.is_err() {
                            break;
                        }
                    }
                    Some(OutboundFrame::Close) | None => break,
                },
                payload = bus.recv() => match payload {
                    Some(payload) => match BusEvent::decode(&payload) {
                        Some(BusEvent::Deliver(event)) => {
                            self.note_phase(&event);
                            if self.emit(event).await.is_err() {
                                break;
                            }
                        }
                        Some(BusEvent::ForceDisconnect { warning_secs }) => {
                            self.phase = Phase::TearingDown;
                            force_leave_at =
                                Some(Instant::now() + Duration::from_secs(warning_secs));
                            let _ = self
                                .emit(ServerEvent::Error {
                                    message:
                                        "you have been reported by multiple peers and will be disconnected"
                                            .to_string(),
                                })
                                .await;
                        }
                        None => {}
                    },
                    // The store's pub/sub is gone; without it the session
                    // cannot hear its peer, drop the transport.
                    None => break,
                },
                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        last_activity = Instant::now();
                        match message {
                            Message::Text(text) => {
                                if !self.dispatch(text.as_str(), command_limit).await {
                                    break;
                                }
                            }
                            Message::Close(_) => break,
                            // Transport pings already refreshed the idle
                            // clock above.
                            _ => {}
                        }
                    }
                    Some(Err(_)) | None => break,
                },
                _ = ticker.tick() => {
                    if last_activity.elapsed() >= idle_timeout {
                        log::info!(
                            "idle timeout: session={}, connection={}",
                            self.session_id,
                            self.connection_id
                        );
                        break;
                    }

                    if force_leave_at.is_some_and(|at| Instant::now() >= at) {
                        log::info!("forced disconnect: session={}", self.session_id);
                        break;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = self.emit(ServerEvent::ShuttingDown).await;
                        break;
                    }
                },
            }
        }
    }

    /// Handle one client command. Returns false to drop the connection.
    async fn dispatch(&mut self, text: &str, command_limit: RateLimit) -> bool {
        let command = match serde_json::from_str::<ClientCommand>(text) {
            Ok(command) => command,
            Err(error) => {
                return self
                    .emit(ServerEvent::Error {
                        message: format!("unrecognized command: {error}"),
                    })
                    .await
                    .is_ok();
            }
        };

        if !self
            .gateway
            .limiter()
            .check(&format!("commands:{}", self.session_id), command_limit)
            .await
        {
            return self
                .emit(ServerEvent::Error {
                    message: "rate limited".to_string(),
                })
                .await
                .is_ok();
        }

        // Any inbound traffic proves liveness for queue purposes.
        if let Err(error) = self.gateway.sessions().touch(&self.session_id).await {
            log::warn!("touch failed: session={}, {error}", self.session_id);
        }

        if self.phase == Phase::TearingDown {
            return true;
        }

        let outcome = match command {
            ClientCommand::Auth { .. } => Ok(None),
            ClientCommand::Ping => Ok(Some(ServerEvent::Pong)),
            ClientCommand::GetStats => match self.gateway.handle_stats().await {
                Ok(snapshot) => Ok(Some(ServerEvent::Stats(snapshot))),
                Err(error) => Err(error),
            },
            ClientCommand::JoinQueue {
                mode,
                connection_type,
                seq,
            } => self
                .gateway
                .handle_join(&self.session_id, mode, connection_type, seq)
                .await
                .map(Some),
            ClientCommand::Next {
                room_id: _,
                mode,
                connection_type,
                seq,
            } => self
                .gateway
                .handle_next(&self.session_id, mode, connection_type, seq)
                .await
                .map(Some),
            ClientCommand::Leave { room_id: _ } => match self
                .gateway
                .handle_leave(&self.session_id)
                .await
            {
                Ok(()) => {
                    self.phase = Phase::Idle;
                    Ok(None)
                }
                Err(error) => Err(error),
            },
            ClientCommand::Signal {
                room_id,
                target_id,
                signal,
            } => self
                .gateway
                .handle_signal(&self.session_id, &room_id, &target_id, signal)
                .await
                .map(|_| None),
        };

        match outcome {
            Ok(Some(event)) => {
                self.note_phase(&event);
                self.emit(event).await.is_ok()
            }
            Ok(None) => true,
            Err(error) => {
                let event = match &error {
                    ServiceError::AuthFailure(_) => ServerEvent::AuthError {
                        message: error.to_string(),
                    },
                    _ => ServerEvent::Error {
                        message: error.to_string(),
                    },
                };

                let alive = self.emit(event).await.is_ok();
                // A broken identity is fatal for the transport.
                alive && !matches!(error, ServiceError::AuthFailure(_))
            }
        }
    }

    /// Track queue/room transitions the events imply.
    fn note_phase(&mut self, event: &ServerEvent) {
        if self.phase == Phase::TearingDown {
            return;
        }

        self.phase = match event {
            ServerEvent::Matched { .. } => Phase::Paired,
            ServerEvent::Waiting { .. } => Phase::Queued,
            ServerEvent::PeerLeft | ServerEvent::PeerSkipped => Phase::Queued,
            _ => self.phase,
        };
    }

    async fn emit(&mut self, event: ServerEvent) -> Result<(), axum::Error> {
        let text = serde_json::to_string(&event).unwrap_or_default();
        self.sink.send(Message::Text(text.into())).await
    }
}
