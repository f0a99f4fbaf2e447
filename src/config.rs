use std::{net::SocketAddr, path::PathBuf, time::Duration};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_SESSION_COOKIE: &str = "studio-session";
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{key} is invalid: {value}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub bind_addr: SocketAddr,
    pub session_cookie: String,
    /// Used when a model has no prompt of its own. Empty disables it.
    pub default_system_prompt: Option<String>,
    pub provider_connect_timeout: Duration,
    pub models_seed: Option<PathBuf>,
}

impl Config {
    /// Reads the process environment, with `.env` as a fallback.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_path = lookup("DATABASE_PATH").ok_or(ConfigError::Missing("DATABASE_PATH"))?;

        let bind_addr = lookup("BIND_ADDR").unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr.parse::<SocketAddr>().map_err(|_| ConfigError::Invalid {
            key: "BIND_ADDR",
            value: bind_addr.clone(),
        })?;

        let timeout = match lookup("PROVIDER_CONNECT_TIMEOUT_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|_| ConfigError::Invalid {
                key: "PROVIDER_CONNECT_TIMEOUT_SECS",
                value: raw.clone(),
            })?,
            None => DEFAULT_CONNECT_TIMEOUT_SECS,
        };

        let default_system_prompt = match lookup("DEFAULT_SYSTEM_PROMPT") {
            Some(prompt) if prompt.trim().is_empty() => None,
            Some(prompt) => Some(prompt),
            None => Some(DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        Ok(Config {
            database_path,
            bind_addr,
            session_cookie: lookup("SESSION_COOKIE")
                .unwrap_or_else(|| DEFAULT_SESSION_COOKIE.to_string()),
            default_system_prompt,
            provider_connect_timeout: Duration::from_secs(timeout),
            models_seed: lookup("MODELS_SEED").map(PathBuf::from),
        })
    }
}
