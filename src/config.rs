use std::{fs::read_to_string, net::SocketAddr, path::PathBuf, str::FromStr};

use anyhow::Result;
use clap::Parser;
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Server {
    ///
    /// The address and port the http api and the websocket gateway are
    /// bound to.
    ///
    #[serde(default = "Server::listen")]
    pub listen: SocketAddr,
    ///
    /// Origins allowed by cors on the http api. An empty list allows any
    /// origin.
    ///
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    ///
    /// stun/turn urls handed to clients at session issuance. The service
    /// itself never connects to them.
    ///
    #[serde(default = "Server::ice_servers")]
    pub ice_servers: Vec<String>,
}

impl Server {
    fn listen() -> SocketAddr {
        "0.0.0.0:4000".parse().unwrap()
    }

    fn ice_servers() -> Vec<String> {
        vec!["stun:stun.l.google.com:19302".to_string()]
    }
}

impl Default for Server {
    fn default() -> Self {
        Self {
            listen: Self::listen(),
            allowed_origins: Default::default(),
            ice_servers: Self::ice_servers(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Store {
    ///
    /// Shared state store url. `redis://` connects to a redis server;
    /// `memory://` runs an in-process store suitable for a single node and
    /// for tests.
    ///
    #[serde(default = "Store::url")]
    pub url: String,
    ///
    /// pub/sub url, defaults to the store url.
    ///
    #[serde(default)]
    pub pubsub_url: Option<String>,
}

impl Store {
    fn url() -> String {
        "redis://127.0.0.1:6379".to_string()
    }

    pub fn pubsub(&self) -> &str {
        self.pubsub_url.as_deref().unwrap_or(&self.url)
    }
}

impl Default for Store {
    fn default() -> Self {
        Self {
            url: Self::url(),
            pubsub_url: None,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Auth {
    ///
    /// Shared secret for token signing. All instances of the service must
    /// agree on it. When left empty a random secret is generated at boot,
    /// which means issued tokens do not survive a restart and cannot be
    /// verified by other instances.
    ///
    #[serde(default)]
    pub secret: String,
    ///
    /// Session time-to-live in seconds. Sessions are anonymous and
    /// short-lived; the ttl is refreshed on every touch.
    ///
    #[serde(default = "Auth::session_ttl_secs")]
    pub session_ttl_secs: u64,
    ///
    /// Token expiry in seconds. Clamped to the session ttl.
    ///
    #[serde(default = "Auth::token_ttl_secs")]
    pub token_ttl_secs: u64,
}

impl Auth {
    fn session_ttl_secs() -> u64 {
        86400
    }

    fn token_ttl_secs() -> u64 {
        86400
    }

    pub fn token_ttl(&self) -> u64 {
        self.token_ttl_secs.min(self.session_ttl_secs)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Limits {
    #[serde(default = "Limits::session_issue_per_minute")]
    pub session_issue_per_minute: u64,
    #[serde(default = "Limits::reports_per_hour")]
    pub reports_per_hour: u64,
    #[serde(default = "Limits::signals_per_second")]
    pub signals_per_second: u64,
    #[serde(default = "Limits::commands_per_second")]
    pub commands_per_second: u64,
    ///
    /// Maximum serialized size of a signal payload in bytes.
    ///
    #[serde(default = "Limits::signal_payload_limit")]
    pub signal_payload_limit: usize,
    ///
    /// Maximum queue entries inspected by a single pairing attempt.
    ///
    #[serde(default = "Limits::pair_scan_limit")]
    pub pair_scan_limit: usize,
    ///
    /// A session last seen more than this many seconds ago is stale for
    /// queue purposes.
    ///
    #[serde(default = "Limits::liveness_window_secs")]
    pub liveness_window_secs: u64,
    ///
    /// Seconds of connection silence before the gateway detaches it.
    ///
    #[serde(default = "Limits::idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    ///
    /// Seconds a client gets to present its token after connecting.
    ///
    #[serde(default = "Limits::auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "Limits::room_ttl_secs")]
    pub room_ttl_secs: u64,
    ///
    /// Delay between the report-threshold warning and the forced leave.
    ///
    #[serde(default = "Limits::warning_delay_secs")]
    pub warning_delay_secs: u64,
    ///
    /// Reports against one session before it is forcibly disconnected.
    ///
    #[serde(default = "Limits::auto_disconnect_threshold")]
    pub auto_disconnect_threshold: u64,
    #[serde(default = "Limits::shutdown_drain_secs")]
    pub shutdown_drain_secs: u64,
}

impl Limits {
    fn session_issue_per_minute() -> u64 {
        10
    }

    fn reports_per_hour() -> u64 {
        5
    }

    fn signals_per_second() -> u64 {
        30
    }

    fn commands_per_second() -> u64 {
        100
    }

    fn signal_payload_limit() -> usize {
        16 * 1024
    }

    fn pair_scan_limit() -> usize {
        50
    }

    fn liveness_window_secs() -> u64 {
        30
    }

    fn idle_timeout_secs() -> u64 {
        60
    }

    fn auth_timeout_secs() -> u64 {
        10
    }

    fn room_ttl_secs() -> u64 {
        3600
    }

    fn warning_delay_secs() -> u64 {
        10
    }

    fn auto_disconnect_threshold() -> u64 {
        3
    }

    fn shutdown_drain_secs() -> u64 {
        5
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            session_issue_per_minute: Self::session_issue_per_minute(),
            reports_per_hour: Self::reports_per_hour(),
            signals_per_second: Self::signals_per_second(),
            commands_per_second: Self::commands_per_second(),
            signal_payload_limit: Self::signal_payload_limit(),
            pair_scan_limit: Self::pair_scan_limit(),
            liveness_window_secs: Self::liveness_window_secs(),
            idle_timeout_secs: Self::idle_timeout_secs(),
            auth_timeout_secs: Self::auth_timeout_secs(),
            room_ttl_secs: Self::room_ttl_secs(),
            warning_delay_secs: Self::warning_delay_secs(),
            auto_disconnect_threshold: Self::auto_disconnect_threshold(),
            shutdown_drain_secs: Self::shutdown_drain_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default = "Log::level")]
    pub level: String,
}

impl Log {
    fn level() -> String {
        "info".to_string()
    }

    pub fn as_level(&self) -> log::Level {
        log::Level::from_str(&self.level).unwrap_or(log::Level::Info)
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: Self::level(),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub store: Store,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: rendezvous-server --config /etc/rendezvous/config.toml
    ///
    #[arg(long, short, env = "RENDEZVOUS_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, env = "RENDEZVOUS_LISTEN")]
    listen: Option<SocketAddr>,
    #[arg(long, env = "RENDEZVOUS_STORE_URL")]
    store_url: Option<String>,
    #[arg(long, env = "RENDEZVOUS_PUBSUB_URL")]
    pubsub_url: Option<String>,
    #[arg(long, env = "RENDEZVOUS_SECRET", hide_env_values = true)]
    secret: Option<String>,
}

impl Config {
    ///
    /// Load configure from config file, command line parameters and
    /// environment.
    ///
    /// If the configuration file path is specified the configuration is read
    /// from the configuration file, otherwise the default configuration is
    /// used. Individual command line parameters and environment variables
    /// override the file.
    ///
    pub fn load() -> Result<Self> {
        let cli = Cli::parse();
        let mut config = match cli.config {
            Some(path) => toml::from_str::<Self>(&read_to_string(path)?)?,
            None => Self::default(),
        };

        if let Some(listen) = cli.listen {
            config.server.listen = listen;
        }

        if let Some(url) = cli.store_url {
            config.store.url = url;
        }

        if let Some(url) = cli.pubsub_url {
            config.store.pubsub_url = Some(url);
        }

        if let Some(secret) = cli.secret {
            config.auth.secret = secret;
        }

        Ok(config)
    }
}
