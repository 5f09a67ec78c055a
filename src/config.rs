use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Root configuration for the agent process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    #[serde(default)]
    pub signaling: SignalingConfig,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServerConfig {
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            web_port: default_web_port(),
            bind_ip: default_bind_ip(),
        }
    }
}

/// Connection to the persistence layer holding cameras/agents/devices.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DatabaseConfig {
    #[serde(default = "default_db_connection")]
    pub connection_string: String,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connection_string: default_db_connection(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Message bus endpoint the EventBus publishes to.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BusConfig {
    #[serde(default = "default_bus_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_bus_topic")]
    pub topic: String,
    #[serde(default = "default_bus_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            endpoint: default_bus_endpoint(),
            topic: default_bus_topic(),
            max_message_bytes: default_bus_max_message_bytes(),
        }
    }
}

/// EventSessionManager timing and bounds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SessionConfig {
    #[serde(default = "default_session_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "default_chunk_duration_secs")]
    pub chunk_duration_secs: u64,
    #[serde(default = "default_encode_queue_capacity")]
    pub encode_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_session_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
            chunk_duration_secs: default_chunk_duration_secs(),
            encode_queue_capacity: default_encode_queue_capacity(),
        }
    }
}

/// Defaults applied to event video chunks and the WS fMP4 encoder.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct VideoConfig {
    #[serde(default = "default_fps")]
    pub default_fps: u32,
    #[serde(default = "default_save_directory")]
    pub save_directory: String,
    #[serde(default = "default_save_enabled")]
    pub save_enabled: bool,
    #[serde(default = "default_resolution_width")]
    pub resolution_width: u32,
    #[serde(default = "default_resolution_height")]
    pub resolution_height: u32,
    #[serde(default = "default_encoder_binary")]
    pub encoder_binary: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            default_fps: default_fps(),
            save_directory: default_save_directory(),
            save_enabled: default_save_enabled(),
            resolution_width: default_resolution_width(),
            resolution_height: default_resolution_height(),
            encoder_binary: default_encoder_binary(),
        }
    }
}

/// STUN/TURN and fan-out limits for the WebRTC publisher.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_server")]
    pub stun_server: String,
    #[serde(default)]
    pub turn_server: Option<String>,
    #[serde(default = "default_max_clients")]
    pub max_clients_per_stream: usize,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_server: default_stun_server(),
            turn_server: None,
            max_clients_per_stream: default_max_clients(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct SignalingConfig {
    #[serde(default = "default_signaling_url")]
    pub url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: default_signaling_url(),
        }
    }
}

fn default_web_port() -> u16 {
    8080
}
fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_db_connection() -> String {
    "mongodb://localhost:27017/edge_video_agent".to_string()
}
fn default_poll_interval_secs() -> u64 {
    5
}
fn default_bus_endpoint() -> String {
    "tcp://127.0.0.1:5560".to_string()
}
fn default_bus_topic() -> String {
    "edge-video-events".to_string()
}
fn default_bus_max_message_bytes() -> usize {
    8 * 1024 * 1024
}
fn default_session_timeout_secs() -> u64 {
    30
}
fn default_check_interval_secs() -> u64 {
    5
}
fn default_chunk_duration_secs() -> u64 {
    300
}
fn default_encode_queue_capacity() -> usize {
    16
}
fn default_fps() -> u32 {
    5
}
fn default_save_directory() -> String {
    "./event_videos".to_string()
}
fn default_save_enabled() -> bool {
    true
}
fn default_resolution_width() -> u32 {
    1280
}
fn default_resolution_height() -> u32 {
    720
}
fn default_encoder_binary() -> String {
    "ffmpeg".to_string()
}
fn default_stun_server() -> String {
    "stun:stun.l.google.com:19302".to_string()
}
fn default_max_clients() -> usize {
    8
}
fn default_reconnect_delay_secs() -> u64 {
    2
}
fn default_signaling_url() -> String {
    "ws://127.0.0.1:9000/signaling".to_string()
}
fn default_timezone() -> String {
    "UTC".to_string()
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("failed to read config file")?;
        let config: Config = toml::from_str(&content).context("failed to parse config file")?;
        Ok(config)
    }

    /// Resolve the configured IANA timezone name. Falls back to UTC and logs
    /// a warning if the name doesn't parse, rather than failing startup over
    /// a cosmetic setting.
    pub fn resolve_timezone(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(timezone = %self.timezone, "unknown timezone name, falling back to UTC");
            chrono_tz::UTC
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_toml_fills_in_defaults() {
        let toml_src = r#"
            [server]
        "#;
        let config: Config = toml::from_str(toml_src).unwrap();
        assert_eq!(config.server.web_port, 8080);
        assert_eq!(config.session.timeout_secs, 30);
        assert_eq!(config.video.default_fps, 5);
        assert_eq!(config.timezone, "UTC");
    }
}
