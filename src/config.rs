//! Konfiguration aus Umgebungsvariablen
//!
//! | Variable                 | Default                  |
//! |--------------------------|--------------------------|
//! | `API_URL`                | `http://localhost:8000`  |
//! | `SIGNALING_URL`          | `ws://localhost:3001`    |
//! | `ICE_SERVERS`            | Google STUN              |
//! | `RECONNECT_BASE_MS`      | `1000`                   |
//! | `RECONNECT_MAX_ATTEMPTS` | `5`                      |
//! | `RECONNECT_MAX_DELAY_MS` | `30000`                  |

use crate::call_engine::PeerSessionConfig;
use crate::media_stream::ReconnectPolicy;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_SIGNALING_URL: &str = "ws://localhost:3001";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_url: String,
    pub signaling_url: String,
    /// Leer heißt: Standard-STUN-Server
    pub ice_servers: Vec<String>,
    pub reconnect: ReconnectPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            ice_servers: Vec::new(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl AppConfig {
    /// Liest die Konfiguration aus der Prozess-Umgebung
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Wie `from_env`, aber mit beliebiger Quelle
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let policy = defaults.reconnect;

        let base_ms = parse_number(&lookup, "RECONNECT_BASE_MS")?;
        let max_attempts = parse_number(&lookup, "RECONNECT_MAX_ATTEMPTS")?;
        let max_delay_ms = parse_number(&lookup, "RECONNECT_MAX_DELAY_MS")?;

        Ok(Self {
            api_url: lookup("API_URL").unwrap_or(defaults.api_url),
            signaling_url: lookup("SIGNALING_URL").unwrap_or(defaults.signaling_url),
            ice_servers: lookup("ICE_SERVERS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            reconnect: ReconnectPolicy {
                base_delay: base_ms.map(Duration::from_millis).unwrap_or(policy.base_delay),
                max_delay: max_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(policy.max_delay),
                max_attempts: max_attempts
                    .map(|n| n as u32)
                    .unwrap_or(policy.max_attempts),
            },
        })
    }

    pub fn peer_session(&self) -> PeerSessionConfig {
        let config = PeerSessionConfig::new(self.signaling_url.clone());
        if self.ice_servers.is_empty() {
            config
        } else {
            config.with_ice_urls(self.ice_servers.clone())
        }
    }
}

fn parse_number<F>(lookup: &F, name: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u32>()
            .map(|n| Some(n as u64))
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}
