//! Edge configuration from the environment.
//!
//! # Variables
//! - `PORT`: public listen port (default 3000)
//! - `SSL_KEY_PATH` + `SSL_CERT_PATH`: when both are set, the edge serves
//!   TLS with ALPN `h2` + `http/1.1` on the same port; setting only one is
//!   a configuration error
//! - `SECRET_KEY`: required; signs and verifies agent tokens
//! - `VERIFY_TOKEN`: required; the claim value every valid token must carry
//! - `JWT_GENERATOR_USERNAME` + `JWT_GENERATOR_PASSWORD`: optional issuer
//!   credentials for `/tunnel_jwt_generator`
//! - `LOG_LEVEL`: tracing filter (default `info`)

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct IssuerCredentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub port: u16,
    pub tls: Option<TlsPaths>,
    pub secret_key: String,
    pub verify_token: String,
    pub issuer: Option<IssuerCredentials>,
    pub log_level: String,
}

impl EdgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&std::env::vars().collect())
    }

    /// Build from an explicit variable map (testable core of `from_env`).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).map(String::as_str).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue(format!("PORT must be a port number, got '{}'", raw)))?,
            None => 3000,
        };

        let tls = match (get("SSL_KEY_PATH"), get("SSL_CERT_PATH")) {
            (Some(key), Some(cert)) => Some(TlsPaths {
                key_path: PathBuf::from(key),
                cert_path: PathBuf::from(cert),
            }),
            (None, None) => None,
            _ => {
                return Err(ConfigError::InvalidValue(
                    "SSL_KEY_PATH and SSL_CERT_PATH must be set together".to_owned(),
                ));
            }
        };

        let secret_key = get("SECRET_KEY")
            .ok_or(ConfigError::MissingVar("SECRET_KEY"))?
            .to_owned();
        let verify_token = get("VERIFY_TOKEN")
            .ok_or(ConfigError::MissingVar("VERIFY_TOKEN"))?
            .to_owned();

        let issuer = match (get("JWT_GENERATOR_USERNAME"), get("JWT_GENERATOR_PASSWORD")) {
            (Some(username), Some(password)) => Some(IssuerCredentials {
                username: username.to_owned(),
                password: password.to_owned(),
            }),
            // A half-configured issuer stays disabled rather than erroring:
            // the endpoint is optional.
            _ => None,
        };

        let log_level = get("LOG_LEVEL").unwrap_or("info").to_owned();

        Ok(EdgeConfig { port, tls, secret_key, verify_token, issuer, log_level })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
