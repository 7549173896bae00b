//! Client configuration
//!
//! Defaults are embedded from `config.toml`. A user file passed on the command line
//! replaces the defaults section by section, and a handful of environment variables
//! (optionally loaded from `.env`) override individual values.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Embedded default configuration
const DEFAULT_CONFIG_TOML: &str = include_str!("../config.toml");

/// Environment variable overriding `server.base_url`
pub const ENV_SERVER_URL: &str = "INTERVIEW_SERVER_URL";

/// Environment variable overriding `rtc.ice_servers` (comma-separated)
pub const ENV_ICE_SERVERS: &str = "INTERVIEW_ICE_SERVERS";

/// Environment variable overriding `transcript.directory`
pub const ENV_TRANSCRIPT_DIR: &str = "INTERVIEW_TRANSCRIPT_DIR";

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub rtc: RtcConfig,
    pub channel: ChannelConfig,
    pub audio: AudioConfig,
    pub transcript: TranscriptConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP base URL of the interview server (e.g. "http://127.0.0.1:8000")
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RtcConfig {
    /// STUN/TURN server URLs used for NAT traversal
    pub ice_servers: Vec<String>,
    /// Upper bound on waiting for ICE candidate gathering before sending the offer
    #[serde(default = "default_ice_gathering_timeout_ms")]
    pub ice_gathering_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Interval between application-level pings; 0 disables them
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_fft_size")]
    pub analyzer_fft_size: usize,
    #[serde(default = "default_smoothing")]
    pub analyzer_smoothing: f32,
    #[serde(default = "default_level_interval_ms")]
    pub level_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptConfig {
    pub user_label: String,
    pub agent_label: String,
    #[serde(default)]
    pub save_on_stop: bool,
    /// Custom transcript directory (None = Documents/InterviewClient/transcripts)
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_ice_gathering_timeout_ms() -> u64 {
    5000
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    15
}

fn default_fft_size() -> usize {
    256
}

fn default_smoothing() -> f32 {
    0.8
}

fn default_level_interval_ms() -> u64 {
    100
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl Config {
    /// Parse a configuration document and validate it
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the embedded defaults, or the given file instead, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if dotenvy::dotenv().is_ok() {
            debug!("Loaded environment from .env");
        }

        let mut config = match path {
            Some(path) => {
                let contents =
                    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                        path: path.to_path_buf(),
                        source,
                    })?;
                info!("Using configuration from {:?}", path);
                Self::from_toml(&contents)?
            }
            None => Self::from_toml(DEFAULT_CONFIG_TOML)?,
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production)
    pub(crate) fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SERVER_URL).filter(|s| !s.trim().is_empty()) {
            self.server.base_url = url.trim().to_string();
        }
        if let Some(servers) = lookup(ENV_ICE_SERVERS) {
            let servers: Vec<String> = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !servers.is_empty() {
                self.rtc.ice_servers = servers;
            }
        }
        if let Some(dir) = lookup(ENV_TRANSCRIPT_DIR).filter(|s| !s.trim().is_empty()) {
            self.transcript.directory = Some(PathBuf::from(dir));
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        url::Url::parse(&self.server.base_url).map_err(|e| ConfigError::Invalid {
            field: "server.base_url",
            reason: e.to_string(),
        })?;
        if self.rtc.ice_servers.is_empty() {
            return Err(ConfigError::Invalid {
                field: "rtc.ice_servers",
                reason: "at least one STUN/TURN server is required".to_string(),
            });
        }
        let fft = self.audio.analyzer_fft_size;
        if fft < 32 || !fft.is_power_of_two() {
            return Err(ConfigError::Invalid {
                field: "audio.analyzer_fft_size",
                reason: format!("{} is not a power of two >= 32", fft),
            });
        }
        if !(0.0..1.0).contains(&self.audio.analyzer_smoothing) {
            return Err(ConfigError::Invalid {
                field: "audio.analyzer_smoothing",
                reason: format!("{} is outside [0, 1)", self.audio.analyzer_smoothing),
            });
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_millis(self.rtc.ice_gathering_timeout_ms)
    }

    pub fn channel_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.channel.connect_timeout_secs)
    }

    pub fn level_interval(&self) -> Duration {
        Duration::from_millis(self.audio.level_interval_ms.max(10))
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    let mut config = Config::from_toml(DEFAULT_CONFIG_TOML).unwrap();
    config.rtc.ice_gathering_timeout_ms = 50;
    config.channel.connect_timeout_secs = 2;
    config.channel.ping_interval_secs = 0;
    config
}
