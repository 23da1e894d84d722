//! Application configuration loaded from environment.

use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from `.env` and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g. `0.0.0.0:4000`).
    pub server_addr: SocketAddr,
    /// PostgreSQL connection URL. When unset, messages are kept in memory.
    pub database_url: Option<String>,
    /// JWT signing secret shared with the REST layer that issues session tokens.
    pub jwt_secret: String,
    /// Log level: `error`, `warn`, `info`, `debug`, `trace`.
    pub log_level: String,
    /// Check the participant list before letting a connection join a room.
    pub enforce_participants: bool,
    /// Upper bound on a single storage call.
    pub persist_timeout: Duration,
    /// Close connections that stay silent for this long.
    pub idle_timeout: Duration,
    /// Maximum message length in characters.
    pub max_message_len: usize,
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let server_addr = std::env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:4000".to_string());
        let server_addr: SocketAddr = server_addr
            .parse()
            .map_err(|_| ConfigLoadError::InvalidServerAddr)?;

        let database_url = std::env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.trim().is_empty());
        let jwt_secret = std::env::var("JWT_SECRET")
            .unwrap_or_else(|_| "unitask_jwt_secret_change_in_production".to_string());
        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let enforce_participants = match std::env::var("ENFORCE_PARTICIPANTS") {
            Ok(raw) => parse_bool(&raw).ok_or(ConfigLoadError::InvalidValue("ENFORCE_PARTICIPANTS"))?,
            Err(_) => true,
        };
        let persist_timeout =
            Duration::from_millis(parse_number("PERSIST_TIMEOUT_MS", 10_000)?);
        let idle_timeout = Duration::from_secs(parse_number("IDLE_TIMEOUT_SECS", 90)?);
        let max_message_len = parse_number("MAX_MESSAGE_LEN", 5_000)? as usize;

        Ok(Self {
            server_addr,
            database_url,
            jwt_secret,
            log_level,
            enforce_participants,
            persist_timeout,
            idle_timeout,
            max_message_len,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 4000)),
            database_url: None,
            jwt_secret: "unitask_jwt_secret_change_in_production".to_string(),
            log_level: "info".to_string(),
            enforce_participants: true,
            persist_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(90),
            max_message_len: 5_000,
        }
    }
}

fn parse_number(key: &'static str, default: u64) -> Result<u64, ConfigLoadError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigLoadError::InvalidValue(key)),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid SERVER_ADDR")]
    InvalidServerAddr,
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
}
