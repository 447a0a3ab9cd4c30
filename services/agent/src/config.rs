//! Agent configuration from the environment.
//!
//! # Variables
//! - `TUNNEL_SERVER_URL`: required; `http(s)://` or `ws(s)://` base URL of
//!   the edge (normalized to `ws(s)://`, trailing slash trimmed)
//! - `TUNNEL_AUTH_TOKEN`: required; bearer token presented at handshake
//! - `LOCAL_PORT`: required; port of the local origin
//! - `LOCAL_HOST`: origin host (default `localhost`)
//! - `PATH_PREFIX`: optional URL prefix this agent claims on its host
//! - `INSECURE`: truthy to skip TLS verification toward the local origin
//! - `DEBUG`: truthy for debug-level logging

use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// `ws://` or `wss://` base URL, without the control-channel path.
    pub server_url: String,
    pub token: String,
    pub local_host: String,
    pub local_port: u16,
    /// Empty string claims the whole host.
    pub path_prefix: String,
    pub insecure: bool,
    pub debug: bool,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Build from an explicit variable map (testable core of `from_env`).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(String::as_str).filter(|v| !v.is_empty());

        let raw_url = get("TUNNEL_SERVER_URL").ok_or(ConfigError::MissingVar("TUNNEL_SERVER_URL"))?;
        let server_url = normalize_server_url(raw_url)?;

        let token = get("TUNNEL_AUTH_TOKEN")
            .ok_or(ConfigError::MissingVar("TUNNEL_AUTH_TOKEN"))?
            .to_owned();

        let raw_port = get("LOCAL_PORT").ok_or(ConfigError::MissingVar("LOCAL_PORT"))?;
        let local_port = raw_port.parse().map_err(|_| {
            ConfigError::InvalidValue(format!("LOCAL_PORT must be a port number, got '{}'", raw_port))
        })?;

        Ok(AgentConfig {
            server_url,
            token,
            local_host: get("LOCAL_HOST").unwrap_or("localhost").to_owned(),
            local_port,
            path_prefix: get("PATH_PREFIX").unwrap_or_default().to_owned(),
            insecure: get("INSECURE").is_some_and(truthy),
            debug: get("DEBUG").is_some_and(truthy),
        })
    }
}

fn truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Accept `http(s)` and `ws(s)` schemes, yielding `ws(s)` with no trailing
/// slash so the control path can be appended verbatim.
fn normalize_server_url(raw: &str) -> Result<String, ConfigError> {
    let normalized = if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else if raw.starts_with("wss://") || raw.starts_with("ws://") {
        raw.to_owned()
    } else {
        return Err(ConfigError::InvalidValue(format!(
            "TUNNEL_SERVER_URL must start with http(s):// or ws(s)://, got '{}'",
            raw
        )));
    };
    Ok(normalized.trim_end_matches('/').to_owned())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
