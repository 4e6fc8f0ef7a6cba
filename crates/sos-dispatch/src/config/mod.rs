use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingSettings {
    /// Search radius for automatic matching (default: 5 km)
    #[serde(default = "default_radius_km")]
    pub radius_km: f64,
}

fn default_radius_km() -> f64 {
    5.0
}

impl Default for MatchingSettings {
    fn default() -> Self {
        Self {
            radius_km: default_radius_km(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ChatSettings {
    /// Lifetime of a chat room after it is minted (default: 24h)
    #[serde(default = "default_chat_ttl_hours")]
    pub session_ttl_hours: u64,
}

fn default_chat_ttl_hours() -> u64 {
    24
}

impl ChatSettings {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_hours.saturating_mul(3600))
    }
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            session_ttl_hours: default_chat_ttl_hours(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuthSettings {
    /// Lifetime of a volunteer login token (default: 4h)
    #[serde(default = "default_volunteer_ttl_hours")]
    pub volunteer_session_ttl_hours: u64,
}

fn default_volunteer_ttl_hours() -> u64 {
    4
}

impl AuthSettings {
    pub fn volunteer_session_ttl(&self) -> Duration {
        Duration::from_secs(self.volunteer_session_ttl_hours.saturating_mul(3600))
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            volunteer_session_ttl_hours: default_volunteer_ttl_hours(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct BusSettings {
    /// Per-topic buffer of the in-memory transport
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_resubscribe_initial_delay_ms")]
    pub resubscribe_initial_delay_ms: u64,
    #[serde(default = "default_resubscribe_max_delay_ms")]
    pub resubscribe_max_delay_ms: u64,
    /// Consecutive failed resubscribes before a listener gives up
    #[serde(default = "default_max_resubscribe_attempts")]
    pub max_resubscribe_attempts: u32,
    /// How long disconnect waits for each listener to wind down
    #[serde(default = "default_listener_shutdown_timeout_ms")]
    pub listener_shutdown_timeout_ms: u64,
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_resubscribe_initial_delay_ms() -> u64 {
    500
}

fn default_resubscribe_max_delay_ms() -> u64 {
    30_000
}

fn default_max_resubscribe_attempts() -> u32 {
    10
}

fn default_listener_shutdown_timeout_ms() -> u64 {
    5_000
}

impl BusSettings {
    pub fn resubscribe_initial_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_initial_delay_ms)
    }

    pub fn resubscribe_max_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_max_delay_ms)
    }

    pub fn listener_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.listener_shutdown_timeout_ms)
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            resubscribe_initial_delay_ms: default_resubscribe_initial_delay_ms(),
            resubscribe_max_delay_ms: default_resubscribe_max_delay_ms(),
            max_resubscribe_attempts: default_max_resubscribe_attempts(),
            listener_shutdown_timeout_ms: default_listener_shutdown_timeout_ms(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewaySettings {
    /// A peer that cannot take a frame within this window is dropped
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Frames queued per connection before sends start waiting
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

fn default_send_timeout_ms() -> u64 {
    5_000
}

fn default_outbound_buffer() -> usize {
    64
}

impl GatewaySettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub matching: MatchingSettings,
    #[serde(default)]
    pub chat: ChatSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// Optional JSON file of volunteers loaded into the store at startup
    #[serde(default)]
    pub seed_file: Option<String>,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables (SOS_SERVER__PORT=8000)
            .add_source(
                Environment::with_prefix("SOS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
