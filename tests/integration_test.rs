use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, anyhow, ensure};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use rendezvous_server::{config::Config, startup};

const EVENT_WAIT: Duration = Duration::from_secs(5);

/// Boot a server on an ephemeral port with the in-process store.
async fn create_server(configure: impl FnOnce(&mut Config)) -> Result<SocketAddr> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    drop(listener);

    let mut config = Config::default();
    config.server.listen = addr;
    config.store.url = "memory://".to_string();
    config.auth.secret = "integration-secret".to_string();
    configure(&mut config);

    tokio::spawn(async move {
        startup(Arc::new(config)).await.unwrap();
    });

    let http = reqwest::Client::new();
    for _ in 0..50 {
        if http
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .is_ok()
        {
            return Ok(addr);
        }

        sleep(Duration::from_millis(100)).await;
    }

    Err(anyhow!("server did not come up"))
}

/// One participant: an anonymous session plus its long-lived connection.
struct PairClient {
    server: SocketAddr,
    http: reqwest::Client,
    session_id: String,
    token: String,
    socket: Option<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl PairClient {
    async fn new(server: SocketAddr) -> Result<Self> {
        let http = reqwest::Client::new();
        let issued: Value = http
            .post(format!("http://{server}/api/session/init"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(Self {
            session_id: issued["sessionId"]
                .as_str()
                .ok_or_else(|| anyhow!("missing sessionId"))?
                .to_string(),
            token: issued["token"]
                .as_str()
                .ok_or_else(|| anyhow!("missing token"))?
                .to_string(),
            socket: None,
            server,
            http,
        })
    }

    /// Open the websocket and run the auth handshake.
    async fn connect(&mut self) -> Result<()> {
        let (socket, _) = connect_async(format!("ws://{}/ws", self.server)).await?;
        self.socket = Some(socket);

        self.send(json!({ "event": "auth", "data": { "token": self.token } }))
            .await?;

        let event = self.read_event().await?;
        ensure!(event["event"] == "auth-ok");
        ensure!(event["data"]["sessionId"] == self.session_id.as_str());
        Ok(())
    }

    async fn send(&mut self, value: Value) -> Result<()> {
        self.socket
            .as_mut()
            .ok_or_else(|| anyhow!("not connected"))?
            .send(Message::text(value.to_string()))
            .await?;

        Ok(())
    }

    /// The next json event frame, within the wait budget.
    async fn read_event(&mut self) -> Result<Value> {
        let socket = self.socket.as_mut().ok_or_else(|| anyhow!("not connected"))?;

        loop {
            let message = timeout(EVENT_WAIT, socket.next())
                .await?
                .ok_or_else(|| anyhow!("connection closed"))??;

            if message.is_text() {
                return Ok(serde_json::from_str(message.to_text()?)?);
            }
        }
    }

    async fn expect_event(&mut self, name: &str) -> Result<Value> {
        let event = self.read_event().await?;
        ensure!(
            event["event"] == name,
            "expected {name}, got {}",
            event["event"]
        );

        Ok(event["data"].clone())
    }

    /// Verify no event arrives within `window`.
    async fn expect_silence(&mut self, window: Duration) -> Result<()> {
        let socket = self.socket.as_mut().ok_or_else(|| anyhow!("not connected"))?;
        match timeout(window, socket.next()).await {
            Err(_) => Ok(()),
            Ok(None) => Err(anyhow!("connection closed")),
            Ok(Some(message)) => Err(anyhow!("unexpected frame: {:?}", message?)),
        }
    }

    /// `join-queue` and its correlated acknowledgement.
    async fn join(&mut self, mode: &str, connection_type: &str, seq: u64) -> Result<Value> {
        self.send(json!({
            "event": "join-queue",
            "data": { "mode": mode, "connectionType": connection_type, "seq": seq },
        }))
        .await?;

        let event = self.read_event().await?;
        ensure!(event["data"]["seq"] == seq);
        Ok(event)
    }

    async fn signal(&mut self, room_id: &str, target_id: &str, payload: Value) -> Result<()> {
        self.send(json!({
            "event": "signal",
            "data": {
                "roomId": room_id,
                "targetId": target_id,
                "signal": { "kind": "offer", "payload": payload },
            },
        }))
        .await
    }

    async fn report(&mut self, target: &str, room_id: &str) -> Result<Value> {
        Ok(self
            .http
            .post(format!("http://{}/api/reports", self.server))
            .bearer_auth(&self.token)
            .json(&json!({
                "reportedSessionId": target,
                "roomId": room_id,
                "reason": "abuse",
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }
}

#[tokio::test]
async fn health_and_stats() -> Result<()> {
    let server = create_server(|_| {}).await?;
    let http = reqwest::Client::new();

    let health: Value = http
        .get(format!("http://{server}/health"))
        .send()
        .await?
        .json()
        .await?;
    ensure!(health["status"] == "ok");
    ensure!(health["uptime"].is_u64());

    let stats: Value = http
        .get(format!("http://{server}/api/stats"))
        .send()
        .await?
        .json()
        .await?;
    ensure!(stats["online"] == 0);
    ensure!(stats["realtime"]["totalWaiting"] == 0);
    ensure!(stats["realtime"]["waitingByMode"]["casual:chat"] == 0);
    Ok(())
}

#[tokio::test]
async fn session_issue_and_verify() -> Result<()> {
    let server = create_server(|_| {}).await?;
    let client = PairClient::new(server).await?;
    let http = reqwest::Client::new();

    let verified: Value = http
        .post(format!("http://{server}/api/session/verify"))
        .bearer_auth(&client.token)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    ensure!(verified["valid"] == true);
    ensure!(verified["sessionId"] == client.session_id.as_str());

    let unauthorized = http
        .post(format!("http://{server}/api/session/verify"))
        .bearer_auth("garbage")
        .send()
        .await?;
    ensure!(unauthorized.status() == 401);

    let missing = http
        .post(format!("http://{server}/api/session/verify"))
        .send()
        .await?;
    ensure!(missing.status() == 401);
    Ok(())
}

#[tokio::test]
async fn session_issue_rate_limited() -> Result<()> {
    let server = create_server(|config| {
        config.limits.session_issue_per_minute = 3;
    })
    .await?;
    let http = reqwest::Client::new();

    for _ in 0..3 {
        let response = http
            .post(format!("http://{server}/api/session/init"))
            .send()
            .await?;
        ensure!(response.status() == 200);
    }

    let response = http
        .post(format!("http://{server}/api/session/init"))
        .send()
        .await?;
    ensure!(response.status() == 429);
    Ok(())
}

#[tokio::test]
async fn symmetric_pairing() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut alice = PairClient::new(server).await?;
    let mut bob = PairClient::new(server).await?;
    alice.connect().await?;
    bob.connect().await?;

    let waiting = alice.join("casual", "chat", 1).await?;
    ensure!(waiting["event"] == "waiting");

    let matched = bob.join("casual", "chat", 2).await?;
    ensure!(matched["event"] == "matched");
    ensure!(matched["data"]["peerId"] == alice.session_id.as_str());
    ensure!(matched["data"]["isInitiator"] == true);

    let notified = alice.expect_event("matched").await?;
    ensure!(notified["peerId"] == bob.session_id.as_str());
    ensure!(notified["isInitiator"] == false);
    ensure!(notified["roomId"] == matched["data"]["roomId"]);
    Ok(())
}

#[tokio::test]
async fn cross_intent_pairing() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut hirer = PairClient::new(server).await?;
    let mut rival = PairClient::new(server).await?;
    let mut freelancer = PairClient::new(server).await?;
    hirer.connect().await?;
    rival.connect().await?;
    freelancer.connect().await?;

    // hire does not pair with hire.
    ensure!(hirer.join("hire", "video", 1).await?["event"] == "waiting");
    ensure!(rival.join("hire", "video", 2).await?["event"] == "waiting");

    // freelance pairs with the longest-waiting hire.
    let matched = freelancer.join("freelance", "video", 3).await?;
    ensure!(matched["event"] == "matched");
    ensure!(matched["data"]["peerId"] == hirer.session_id.as_str());

    let notified = hirer.expect_event("matched").await?;
    ensure!(notified["peerId"] == freelancer.session_id.as_str());
    Ok(())
}

#[tokio::test]
async fn skip_cascade() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut alice = PairClient::new(server).await?;
    let mut bob = PairClient::new(server).await?;
    let mut carol = PairClient::new(server).await?;
    alice.connect().await?;
    bob.connect().await?;
    carol.connect().await?;

    alice.join("casual", "chat", 1).await?;
    let matched = bob.join("casual", "chat", 2).await?;
    let room_id = matched["data"]["roomId"]
        .as_str()
        .ok_or_else(|| anyhow!("missing roomId"))?
        .to_string();
    alice.expect_event("matched").await?;

    ensure!(carol.join("casual", "chat", 3).await?["event"] == "waiting");

    // Alice skips: the abandoned Bob hears about it first and is then
    // immediately re-paired with the waiting Carol; Alice goes back to the
    // queue because nobody else is left.
    alice
        .send(json!({
            "event": "next",
            "data": {
                "roomId": room_id,
                "mode": "casual",
                "connectionType": "chat",
                "seq": 4,
            },
        }))
        .await?;

    let ack = alice.read_event().await?;
    ensure!(ack["event"] == "waiting");
    ensure!(ack["data"]["seq"] == 4);

    bob.expect_event("peer-skipped").await?;
    let rematched = bob.expect_event("matched").await?;
    ensure!(rematched["peerId"] == carol.session_id.as_str());
    ensure!(rematched["isInitiator"] == true);

    let carol_matched = carol.expect_event("matched").await?;
    ensure!(carol_matched["peerId"] == bob.session_id.as_str());
    ensure!(carol_matched["isInitiator"] == false);
    ensure!(carol_matched["roomId"] != room_id.as_str());
    Ok(())
}

#[tokio::test]
async fn leave_notifies_counterparty() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut alice = PairClient::new(server).await?;
    let mut bob = PairClient::new(server).await?;
    alice.connect().await?;
    bob.connect().await?;

    alice.join("review", "chat", 1).await?;
    bob.join("review", "chat", 2).await?;
    alice.expect_event("matched").await?;

    alice
        .send(json!({ "event": "leave", "data": {} }))
        .await?;

    bob.expect_event("peer-left").await?;
    Ok(())
}

#[tokio::test]
async fn signal_relay_confinement() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut alice = PairClient::new(server).await?;
    let mut bob = PairClient::new(server).await?;
    let mut eve = PairClient::new(server).await?;
    alice.connect().await?;
    bob.connect().await?;
    eve.connect().await?;

    alice.join("collab", "video", 1).await?;
    let matched = bob.join("collab", "video", 2).await?;
    let room_id = matched["data"]["roomId"]
        .as_str()
        .ok_or_else(|| anyhow!("missing roomId"))?
        .to_string();
    alice.expect_event("matched").await?;

    bob.signal(&room_id, &alice.session_id, json!({ "sdp": "offer" }))
        .await?;

    let signal = alice.expect_event("signal").await?;
    ensure!(signal["fromId"] == bob.session_id.as_str());
    ensure!(signal["signal"]["payload"]["sdp"] == "offer");

    // An outsider cannot inject into the room.
    let target = alice.session_id.clone();
    eve.signal(&room_id, &target, json!({ "sdp": "evil" })).await?;
    alice.expect_silence(Duration::from_millis(500)).await?;

    // An oversized payload is rejected with a typed error.
    let huge = "x".repeat(16 * 1024 + 1);
    bob.signal(&room_id, &alice.session_id, json!(huge)).await?;
    let error = bob.expect_event("error").await?;
    ensure!(
        error["message"]
            .as_str()
            .ok_or_else(|| anyhow!("missing message"))?
            .contains("exceeds")
    );
    Ok(())
}

#[tokio::test]
async fn stale_socket_tab_swap() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut alice = PairClient::new(server).await?;
    let mut bob = PairClient::new(server).await?;
    alice.connect().await?;
    bob.connect().await?;

    alice.join("casual", "video", 1).await?;
    let matched = bob.join("casual", "video", 2).await?;
    let room_id = matched["data"]["roomId"]
        .as_str()
        .ok_or_else(|| anyhow!("missing roomId"))?
        .to_string();
    alice.expect_event("matched").await?;

    // A second tab presents the same token; the session's binding moves to
    // the new transport and the server closes the first.
    let mut second_tab = PairClient {
        server,
        http: reqwest::Client::new(),
        session_id: alice.session_id.clone(),
        token: alice.token.clone(),
        socket: None,
    };
    second_tab.connect().await?;

    // The first tab's transport dying must not tear down the room.
    drop(alice);
    sleep(Duration::from_millis(300)).await;

    bob.expect_silence(Duration::from_millis(300)).await?;

    second_tab
        .signal(&room_id, &bob.session_id, json!({ "sdp": "still-here" }))
        .await?;
    let signal = bob.expect_event("signal").await?;
    ensure!(signal["fromId"] == second_tab.session_id.as_str());
    Ok(())
}

#[tokio::test]
async fn auto_disconnect_after_reports() -> Result<()> {
    let server = create_server(|config| {
        config.limits.warning_delay_secs = 0;
    })
    .await?;

    let mut target = PairClient::new(server).await?;
    let mut peer = PairClient::new(server).await?;
    target.connect().await?;
    peer.connect().await?;

    target.join("pitch", "chat", 1).await?;
    let matched = peer.join("pitch", "chat", 2).await?;
    let room_id = matched["data"]["roomId"]
        .as_str()
        .ok_or_else(|| anyhow!("missing roomId"))?
        .to_string();
    target.expect_event("matched").await?;

    // Two reports stay below the threshold.
    for expected in [false, false] {
        let mut reporter = PairClient::new(server).await?;
        let outcome = reporter.report(&target.session_id, &room_id).await?;
        ensure!(outcome["shouldAutoDisconnect"] == expected);
    }

    // The third crosses it.
    let mut reporter = PairClient::new(server).await?;
    let outcome = reporter.report(&target.session_id, &room_id).await?;
    ensure!(outcome["shouldAutoDisconnect"] == true);

    // The target is warned, then forced off; the counterparty learns its
    // peer is gone.
    let warning = target.expect_event("error").await?;
    ensure!(
        warning["message"]
            .as_str()
            .ok_or_else(|| anyhow!("missing message"))?
            .contains("reported")
    );
    peer.expect_event("peer-left").await?;

    let socket = target.socket.as_mut().ok_or_else(|| anyhow!("not connected"))?;
    let closed = timeout(EVENT_WAIT, async {
        while let Some(message) = socket.next().await {
            if matches!(message, Ok(Message::Close(_)) | Err(_)) {
                break;
            }
        }
    })
    .await;
    ensure!(closed.is_ok());
    Ok(())
}

#[tokio::test]
async fn self_report_rejected() -> Result<()> {
    let server = create_server(|_| {}).await?;
    let me = PairClient::new(server).await?;

    let response = me
        .http
        .post(format!("http://{server}/api/reports"))
        .bearer_auth(&me.token)
        .json(&json!({
            "reportedSessionId": me.session_id,
            "roomId": "room",
            "reason": "abuse",
        }))
        .send()
        .await?;
    ensure!(response.status() == 400);
    Ok(())
}

#[tokio::test]
async fn heartbeat_and_stats_event() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let mut client = PairClient::new(server).await?;
    client.connect().await?;

    client.send(json!({ "event": "ping" })).await?;
    client.expect_event("pong").await?;

    client.send(json!({ "event": "get-stats" })).await?;
    let stats = client.expect_event("stats").await?;
    ensure!(stats["online"] == 1);
    Ok(())
}

#[tokio::test]
async fn unauthenticated_socket_rejected() -> Result<()> {
    let server = create_server(|_| {}).await?;

    let (mut socket, _) = connect_async(format!("ws://{server}/ws")).await?;
    socket
        .send(Message::text(
            json!({ "event": "auth", "data": { "token": "garbage" } }).to_string(),
        ))
        .await?;

    let message = timeout(EVENT_WAIT, socket.next())
        .await?
        .ok_or_else(|| anyhow!("connection closed early"))??;
    let event: Value = serde_json::from_str(message.to_text()?)?;
    ensure!(event["event"] == "auth-error");
    Ok(())
}
