use crate::sfu::{SessionManager, WebRtcTransport};
use serde::Deserialize;
use std::sync::Arc;

const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bind_address: String,
    pub stun_servers: Vec<String>,
    #[serde(default)]
    pub turn_servers: Vec<TurnServer>,
    /// Addresses announced as host candidates when behind 1:1 NAT
    #[serde(default)]
    pub public_ips: Vec<String>,
    /// ICE UDP port range; 0/0 lets the OS pick
    #[serde(default)]
    pub udp_port_min: u16,
    #[serde(default)]
    pub udp_port_max: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            stun_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            turn_servers: vec![],
            public_ips: vec![],
            udp_port_min: 0,
            udp_port_max: 0,
        }
    }
}

impl Config {
    /// Load from `.env`, an optional `huddle.toml` and `HUDDLE_*` environment
    /// variables, later sources overriding earlier ones
    pub fn load() -> anyhow::Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            tracing::debug!("No .env file loaded: {}", e);
        }

        let settings = config::Config::builder()
            .set_default("bind_address", "0.0.0.0:8080")?
            .set_default("stun_servers", vec![DEFAULT_STUN_SERVER])?
            .set_default("public_ips", Vec::<String>::new())?
            .set_default("udp_port_min", 0)?
            .set_default("udp_port_max", 0)?
            .add_source(config::File::with_name("huddle").required(false))
            .add_source(
                config::Environment::with_prefix("HUDDLE")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("stun_servers")
                    .with_list_parse_key("public_ips"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        if config.udp_port_min > config.udp_port_max {
            anyhow::bail!(
                "udp_port_min ({}) must not exceed udp_port_max ({})",
                config.udp_port_min,
                config.udp_port_max
            );
        }

        Ok(config)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: Arc<SessionManager<WebRtcTransport>>,
}

impl AppState {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let transport = WebRtcTransport::new(&config)?;
        let sessions = Arc::new(SessionManager::new(transport));

        Ok(Self { config, sessions })
    }
}
