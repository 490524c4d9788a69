pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod queue;
pub mod relay;
pub mod room;
pub mod safety;
pub mod session;
pub mod statistics;
pub mod store;
pub mod util;

use std::sync::Arc;

use tokio::sync::watch;

use self::{
    config::Config,
    gateway::{Gateway, GatewayOptions},
    queue::QueueEngine,
    relay::SignalingRelay,
    room::RoomRegistry,
    safety::{RateLimiter, SafetyLayer},
    session::SessionAuthority,
    statistics::Statistics,
};

#[rustfmt::skip]
pub static SOFTWARE: &str = concat!(
    "rendezvous-server.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let the integration tests use the crate directly and start
/// the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let store = store::connect(&config).await?;
    let statistics = Statistics::default();
    let sessions = SessionAuthority::new(store.clone(), &config);
    let rooms = RoomRegistry::new(store.clone(), &config);
    let queues = QueueEngine::new(store.clone(), sessions.clone(), rooms.clone(), &config);
    let relay = SignalingRelay::new(store.clone(), rooms.clone(), &config);
    let limiter = RateLimiter::new(store.clone());
    let safety = SafetyLayer::new(store.clone(), sessions.clone(), limiter.clone(), &config);

    let (shutdown_tx, shutdown) = watch::channel(false);
    let gateway = Gateway::new(GatewayOptions {
        store,
        sessions,
        queues,
        rooms,
        relay,
        safety,
        limiter,
        statistics,
        config: config.clone(),
        shutdown,
    });

    log::info!("{SOFTWARE} starting, store={}", config.store.url);

    api::start_server(config, gateway, shutdown_tx).await
}
