use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Query, State, WebSocketUpgrade},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response, Sse, sse::KeepAlive},
    routing::{get, post},
};

use serde::Deserialize;
use serde_json::json;
use tokio::{net::TcpListener, sync::watch};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    config::Config,
    error::{AuthFailureKind, ServiceError, ServiceResult},
    gateway::{Gateway, connection::Connection},
    safety::{RateLimit, ReportRequest},
};

pub struct ApiState {
    config: Arc<Config>,
    gateway: Gateway,
    uptime: Instant,
}

/// Room lifecycle and safety events pushed to `/api/events` subscribers.
///
/// Operators watch pairing churn and report activity here; signal payloads
/// and queue contents never appear on this stream.
pub mod events {
    use std::sync::LazyLock;

    use axum::response::sse::Event;
    use futures_util::{Stream, StreamExt};
    use serde::Serialize;
    use tokio::sync::broadcast::{Sender, channel};
    use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

    use crate::protocol::{Intent, Medium};

    #[derive(Debug, Clone, Serialize)]
    #[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
    pub enum ObserverEvent {
        Matched {
            room_id: String,
            mode: Intent,
            connection_type: Medium,
            initiator_id: String,
        },
        RoomClosed {
            room_id: String,
            participants: Vec<String>,
        },
        ReportFiled {
            report_id: String,
            reported_id: String,
        },
    }

    impl ObserverEvent {
        pub fn name(&self) -> &'static str {
            match self {
                Self::Matched { .. } => "matched",
                Self::RoomClosed { .. } => "room-closed",
                Self::ReportFiled { .. } => "report-filed",
            }
        }
    }

    static CHANNEL: LazyLock<Sender<ObserverEvent>> = LazyLock::new(|| channel(16).0);

    /// Publish to whoever is watching. A slow subscriber that lags out of
    /// the channel just misses events; the stream is advisory.
    pub fn emit(event: ObserverEvent) {
        if CHANNEL.receiver_count() > 0 {
            let _ = CHANNEL.send(event);
        }
    }

    /// An sse frame per observer event, named after its kind.
    pub fn subscribe() -> impl Stream<Item = Result<Event, BroadcastStreamRecvError>> {
        BroadcastStream::new(CHANNEL.subscribe()).map(|item| {
            item.map(|event| {
                Event::default()
                    .event(event.name())
                    .json_data(&event)
                    .unwrap_or_default()
            })
        })
    }
}

#[derive(Deserialize)]
struct ReportsQuery {
    status: Option<String>,
}

fn bearer<'a>(headers: &'a HeaderMap) -> ServiceResult<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|it| it.to_str().ok())
        .and_then(|it| it.strip_prefix("Bearer "))
        .filter(|it| !it.is_empty())
        .ok_or(ServiceError::AuthFailure(AuthFailureKind::MissingToken))
}

/// The address the issue rate limit is keyed on: the first forwarded hop
/// when the service sits behind a proxy, otherwise the transport peer.
fn client_address(headers: &HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|it| it.to_str().ok())
        .and_then(|it| it.split(',').next())
        .map(|it| it.trim().to_string())
        .unwrap_or_else(|| peer.ip().to_string())
}

async fn session_init(
    State(state): State<Arc<ApiState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let address = client_address(&headers, peer);
    let allowed = state
        .gateway
        .limiter()
        .check(
            &format!("issue:{address}"),
            RateLimit::per_minute(state.config.limits.session_issue_per_minute),
        )
        .await;
    if !allowed {
        return ServiceError::RateLimited.into_response();
    }

    match state.gateway.sessions().issue().await {
        Ok(issued) => Json(json!({
            "sessionId": issued.session_id,
            "token": issued.token,
            "expiresIn": issued.expires_in,
            "iceServers": state.config.server.ice_servers,
        }))
        .into_response(),
        Err(error) => error.into_response(),
    }
}

async fn session_verify(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let result: ServiceResult<_> = async {
        let token = bearer(&headers)?;
        let session_id = state.gateway.sessions().authenticate(token).await?;
        state.gateway.sessions().touch(&session_id).await?;
        Ok(Json(json!({ "valid": true, "sessionId": session_id })))
    }
    .await;

    match result {
        Ok(body) => body.into_response(),
        Err(error) => error.into_response(),
    }
}

async fn reports_create(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Json(request): Json<ReportRequest>,
) -> Response {
    let result: ServiceResult<_> = async {
        let token = bearer(&headers)?;
        let reporter = state.gateway.sessions().authenticate(token).await?;
        let target = request.reported_session_id.clone();
        let outcome = state.gateway.safety().file_report(&reporter, request).await?;

        events::emit(events::ObserverEvent::ReportFiled {
            report_id: outcome.report_id.clone(),
            reported_id: target.clone(),
        });

        if outcome.should_auto_disconnect {
            state.gateway.force_disconnect(&target).await?;
        }

        Ok(Json(outcome))
    }
    .await;

    match result {
        Ok(body) => body.into_response(),
        Err(error) => error.into_response(),
    }
}

async fn reports_list(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<ReportsQuery>,
) -> Response {
    let result: ServiceResult<_> = async {
        let token = bearer(&headers)?;
        state.gateway.sessions().authenticate(token).await?;

        let reports = state
            .gateway
            .safety()
            .recent_reports(query.status.as_deref())
            .await?;
        Ok(Json(json!({ "reports": reports })))
    }
    .await;

    match result {
        Ok(body) => body.into_response(),
        Err(error) => error.into_response(),
    }
}

async fn stats(State(state): State<Arc<ApiState>>) -> Response {
    match state.gateway.handle_stats().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(error) => error.into_response(),
    }
}

async fn health(State(state): State<Arc<ApiState>>) -> Response {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime.elapsed().as_secs(),
    }))
    .into_response()
}

async fn websocket(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> Response {
    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| Connection::launch(socket, gateway))
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .server
        .allowed_origins
        .iter()
        .filter_map(|it| it.parse().ok())
        .collect();

    if origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/session/init", post(session_init))
        .route("/api/session/verify", post(session_verify))
        .route("/api/reports", post(reports_create).get(reports_list))
        .route("/api/stats", get(stats))
        .route("/health", get(health))
        .route("/ws", get(websocket))
        .route(
            "/api/events",
            get(|| async move { Sse::new(events::subscribe()).keep_alive(KeepAlive::default()) }),
        )
        .layer(cors_layer(&state.config))
        .with_state(state)
}

/// start http server
///
/// Serves the rest api, the server-sent observer stream and the websocket
/// gateway on one listener. Returns once the termination signal fired and
/// the drain window elapsed.
pub async fn start_server(
    config: Arc<Config>,
    gateway: Gateway,
    shutdown: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let state = Arc::new(ApiState {
        config: config.clone(),
        gateway: gateway.clone(),
        uptime: Instant::now(),
    });

    let app = router(state);
    let listener = TcpListener::bind(config.server.listen).await?;

    log::info!("api server listening={:?}", config.server.listen);

    let drain = std::time::Duration::from_secs(config.limits.shutdown_drain_secs);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        log::info!("termination signal received, draining connections");

        // Flip the watch first so every connection task can say goodbye
        // within the drain window.
        let _ = shutdown.send(true);
        gateway.registry().broadcast_shutdown();
        tokio::time::sleep(drain).await;
    })
    .await?;

    Ok(())
}
